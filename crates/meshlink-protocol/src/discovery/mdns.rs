/// mDNS/DNS-SD implementation of [`LanServiceDiscovery`] on `mdns-sd`.
use std::collections::HashMap;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;

use crate::discovery::local::{
    LanAdvert, LanEvent, LanService, LanServiceDiscovery, TXT_ID, TXT_NAME, TXT_PUBLIC_KEY,
    TXT_TYPE,
};
use crate::error::MeshError;

const BACKEND: &str = "local-advertisement";
const EVENT_CAPACITY: usize = 64;

fn mdns_error(e: mdns_sd::Error) -> MeshError {
    MeshError::Discovery {
        backend: BACKEND,
        reason: e.to_string(),
    }
}

/// Browses and advertises through the `mdns-sd` daemon thread.
pub struct MdnsServiceDiscovery {
    daemon: ServiceDaemon,
}

impl MdnsServiceDiscovery {
    /// Start the mDNS daemon. Fails when no multicast-capable interface
    /// is available.
    pub fn new() -> Result<Self, MeshError> {
        let daemon = ServiceDaemon::new().map_err(mdns_error)?;
        Ok(Self { daemon })
    }
}

impl Drop for MdnsServiceDiscovery {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            tracing::debug!("mdns: shutdown failed: {e}");
        }
    }
}

fn to_lan_service(info: &ServiceInfo, service_type: &str) -> LanService {
    let fullname = info.get_fullname().to_string();
    let instance_name = fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.').to_string())
        .unwrap_or_else(|| fullname.clone());

    let mut properties = HashMap::new();
    for key in [TXT_ID, TXT_NAME, TXT_TYPE, TXT_PUBLIC_KEY] {
        if let Some(value) = info.get_property_val_str(key) {
            properties.insert(key.to_string(), value.to_string());
        }
    }

    LanService {
        fullname,
        instance_name,
        host: info.get_hostname().to_string(),
        addresses: info.get_addresses().iter().copied().collect(),
        port: info.get_port(),
        properties,
    }
}

#[async_trait::async_trait]
impl LanServiceDiscovery for MdnsServiceDiscovery {
    async fn browse(&self, service_type: &str) -> Result<mpsc::Receiver<LanEvent>, MeshError> {
        let events = self.daemon.browse(service_type).map_err(mdns_error)?;
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let service_type = service_type.to_string();

        tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                let lan_event = match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let service = to_lan_service(&info, &service_type);
                        if service.addresses.is_empty() && service.host.is_empty() {
                            LanEvent::ResolveFailed {
                                fullname: service.fullname,
                                reason: "no address".into(),
                            }
                        } else {
                            LanEvent::Resolved(service)
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => LanEvent::Removed { fullname },
                    ServiceEvent::SearchStopped(_) => break,
                    other => {
                        tracing::trace!("mdns: {other:?}");
                        continue;
                    }
                };
                if tx.send(lan_event).await.is_err() {
                    break;
                }
            }
            tracing::debug!("mdns: browse of {service_type} ended");
        });

        Ok(rx)
    }

    async fn stop_browse(&self, service_type: &str) -> Result<(), MeshError> {
        self.daemon.stop_browse(service_type).map_err(mdns_error)
    }

    async fn register(&self, advert: &LanAdvert) -> Result<String, MeshError> {
        let host_name = format!(
            "{}.local.",
            advert
                .properties
                .get(TXT_ID)
                .map(String::as_str)
                .unwrap_or("meshlink")
        );
        let info = ServiceInfo::new(
            &advert.service_type,
            &advert.instance_name,
            &host_name,
            "",
            advert.port,
            advert.properties.clone(),
        )
        .map_err(|e| MeshError::Registration(e.to_string()))?
        .enable_addr_auto();

        let fullname = info.get_fullname().to_string();
        self.daemon
            .register(info)
            .map_err(|e| MeshError::Registration(e.to_string()))?;
        Ok(fullname)
    }

    async fn unregister(&self, fullname: &str) -> Result<(), MeshError> {
        // The returned status channel only reports announcement progress.
        self.daemon.unregister(fullname).map_err(mdns_error)?;
        Ok(())
    }
}
