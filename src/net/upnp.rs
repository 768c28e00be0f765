use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;
use regex::Regex;
use tokio::{net::UdpSocket, sync::Mutex, time::timeout};
use tracing::{debug, warn};

use crate::{
    config::Protocol,
    error::MappingError,
    net::{MappingRequest, PortMappingClient},
};

const SSDP_MULTICAST: &str = "239.255.255.250:1900";
const SEARCH_TARGET: &str = "urn:schemas-upnp-org:device:InternetGatewayDevice:1";

/// WANIPConnection first; PPP variants answer on DSL gateways.
const SERVICE_TYPES: [&str; 2] = [
    "urn:schemas-upnp-org:service:WANIPConnection:1",
    "urn:schemas-upnp-org:service:WANPPPConnection:1",
];

/// UPnP error 714: NoSuchEntryInArray. Deleting a mapping the gateway does
/// not hold.
const NO_SUCH_ENTRY: u16 = 714;

#[derive(Debug, Clone)]
struct Gateway {
    control_url: String,
    service_type: String,
    local_ip: IpAddr,
}

/// IGD port-mapping client: SSDP discovery over UDP multicast, then SOAP
/// `AddPortMapping`/`DeletePortMapping` against the gateway's WANConnection
/// control endpoint. Consumer routers are slow and occasionally drop
/// requests, so every action runs under a timeout with a bounded
/// retry/backoff loop.
pub struct UpnpClient {
    http: reqwest::Client,
    gateway: Mutex<Option<Gateway>>,
    attempt_timeout: Duration,
    attempts: u32,
    backoff: Duration,
}

impl UpnpClient {
    pub fn new() -> Self {
        Self::with_limits(Duration::from_secs(3), 3, Duration::from_millis(500))
    }

    pub fn with_limits(attempt_timeout: Duration, attempts: u32, backoff: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            gateway: Mutex::new(None),
            attempt_timeout,
            attempts: attempts.max(1),
            backoff,
        }
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        // attempt is 1-based; doubles per attempt, capped at 8x base.
        let pow = attempt.saturating_sub(1).min(3);
        self.backoff * 2u32.pow(pow)
    }

    async fn gateway(&self) -> Result<Gateway, MappingError> {
        let mut cached = self.gateway.lock().await;
        if let Some(gw) = cached.as_ref() {
            return Ok(gw.clone());
        }
        let gw = self.discover().await?;
        debug!(control_url = %gw.control_url, service = %gw.service_type, "gateway discovered");
        *cached = Some(gw.clone());
        Ok(gw)
    }

    async fn invalidate_gateway(&self) {
        *self.gateway.lock().await = None;
    }

    /// SSDP M-SEARCH, then device-description fetch to locate the
    /// WANConnection control URL.
    async fn discover(&self) -> Result<Gateway, MappingError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| MappingError::Protocol(e.to_string()))?;

        let search = format!(
            "M-SEARCH * HTTP/1.1\r\n\
             HOST: {SSDP_MULTICAST}\r\n\
             MAN: \"ssdp:discover\"\r\n\
             MX: 2\r\n\
             ST: {SEARCH_TARGET}\r\n\
             \r\n"
        );
        socket
            .send_to(search.as_bytes(), SSDP_MULTICAST)
            .await
            .map_err(|e| MappingError::Protocol(e.to_string()))?;

        let mut buf = [0u8; 2048];
        let (len, responder) = timeout(self.attempt_timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| MappingError::Unavailable)?
            .map_err(|e| MappingError::Protocol(e.to_string()))?;

        let response = String::from_utf8_lossy(&buf[..len]);
        let location = parse_ssdp_location(&response).ok_or(MappingError::Unavailable)?;

        let description = timeout(self.attempt_timeout, async {
            self.http
                .get(&location)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await
        })
        .await
        .map_err(|_| MappingError::Timeout(self.attempt_timeout))?
        .map_err(|e| MappingError::Protocol(e.to_string()))?;

        let (service_type, control_path) =
            find_wan_service(&description).ok_or(MappingError::Unavailable)?;
        let control_url = resolve_control_url(&location, &control_path)
            .ok_or_else(|| MappingError::Protocol("unresolvable control URL".to_string()))?;

        let local_ip = local_ip_towards(responder)
            .await
            .ok_or_else(|| MappingError::Protocol("cannot determine local address".to_string()))?;

        Ok(Gateway {
            control_url,
            service_type,
            local_ip,
        })
    }

    async fn soap(
        &self,
        gateway: &Gateway,
        action: &str,
        body: &str,
    ) -> Result<String, MappingError> {
        let envelope = soap_envelope(&gateway.service_type, action, body);
        let soap_action = format!("\"{}#{}\"", gateway.service_type, action);

        let response = timeout(self.attempt_timeout, async {
            self.http
                .post(&gateway.control_url)
                .header("Content-Type", "text/xml; charset=\"utf-8\"")
                .header("SOAPAction", soap_action)
                .body(envelope)
                .send()
                .await
        })
        .await
        .map_err(|_| MappingError::Timeout(self.attempt_timeout))?
        .map_err(|e| MappingError::Protocol(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| MappingError::Protocol(e.to_string()))?;

        if !status.is_success() {
            if let Some(code) = parse_soap_fault(&text) {
                return Err(MappingError::Rejected { code });
            }
            return Err(MappingError::Protocol(format!("HTTP {status}")));
        }
        Ok(text)
    }

    /// Runs one SOAP action with the retry budget. Discovery state is
    /// dropped after a failed attempt so the next one re-searches.
    async fn with_retries<F, Fut>(&self, describe: &str, call: F) -> Result<(), MappingError>
    where
        F: Fn(Gateway) -> Fut,
        Fut: Future<Output = Result<(), MappingError>> + Send,
    {
        let mut last = MappingError::Unavailable;
        for attempt in 1..=self.attempts {
            let result = match self.gateway().await {
                Ok(gw) => call(gw).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    warn!(action = describe, attempt, error = %e, "gateway action failed, retrying");
                    self.invalidate_gateway().await;
                    tokio::time::sleep(self.backoff_for(attempt)).await;
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }
}

impl Default for UpnpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortMappingClient for UpnpClient {
    async fn map(&self, request: &MappingRequest) -> Result<(), MappingError> {
        self.with_retries("AddPortMapping", move |gw: Gateway| async move {
            let body = add_mapping_body(request, gw.local_ip);
            self.soap(&gw, "AddPortMapping", &body).await.map(|_| ())
        })
        .await
    }

    async fn unmap(&self, external_port: u16, protocol: Protocol) -> Result<(), MappingError> {
        let result = self
            .with_retries("DeletePortMapping", move |gw: Gateway| async move {
                let body = delete_mapping_body(external_port, protocol);
                self.soap(&gw, "DeletePortMapping", &body).await.map(|_| ())
            })
            .await;

        match result {
            Err(MappingError::Rejected { code }) if code == NO_SUCH_ENTRY => Ok(()),
            other => other,
        }
    }
}

/// Binds a throwaway socket "towards" the gateway to learn which local
/// address the router sees.
async fn local_ip_towards(responder: SocketAddr) -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect(responder).await.ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

fn parse_ssdp_location(response: &str) -> Option<String> {
    let re = Regex::new(r"(?im)^location:\s*(\S+)").unwrap();
    re.captures(response).map(|c| c[1].to_string())
}

/// Scans the device description for the first supported WANConnection
/// service and returns (serviceType, controlURL).
fn find_wan_service(description: &str) -> Option<(String, String)> {
    let service_re = Regex::new(r"(?s)<service>(.*?)</service>").unwrap();
    let type_re = Regex::new(r"<serviceType>\s*([^<]+?)\s*</serviceType>").unwrap();
    let control_re = Regex::new(r"<controlURL>\s*([^<]+?)\s*</controlURL>").unwrap();

    for block in service_re.captures_iter(description) {
        let block = &block[1];
        let Some(service_type) = type_re.captures(block).map(|c| c[1].to_string()) else {
            continue;
        };
        if !SERVICE_TYPES.contains(&service_type.as_str()) {
            continue;
        }
        if let Some(control) = control_re.captures(block).map(|c| c[1].to_string()) {
            return Some((service_type, control));
        }
    }
    None
}

fn resolve_control_url(location: &str, control_path: &str) -> Option<String> {
    if control_path.starts_with("http://") || control_path.starts_with("https://") {
        return Some(control_path.to_string());
    }
    // Base = scheme://host:port of the description URL.
    let scheme_end = location.find("://")? + 3;
    let host_end = location[scheme_end..]
        .find('/')
        .map(|i| scheme_end + i)
        .unwrap_or(location.len());
    let base = &location[..host_end];
    if control_path.starts_with('/') {
        Some(format!("{base}{control_path}"))
    } else {
        Some(format!("{base}/{control_path}"))
    }
}

fn soap_envelope(service_type: &str, action: &str, body: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" s:encodingStyle="http://schemas.xmlsoap.org/soap/encoding/">
<s:Body><u:{action} xmlns:u="{service_type}">{body}</u:{action}></s:Body>
</s:Envelope>"#
    )
}

fn add_mapping_body(request: &MappingRequest, local_ip: IpAddr) -> String {
    format!(
        "<NewRemoteHost></NewRemoteHost>\
         <NewExternalPort>{}</NewExternalPort>\
         <NewProtocol>{}</NewProtocol>\
         <NewInternalPort>{}</NewInternalPort>\
         <NewInternalClient>{}</NewInternalClient>\
         <NewEnabled>1</NewEnabled>\
         <NewPortMappingDescription>{}</NewPortMappingDescription>\
         <NewLeaseDuration>{}</NewLeaseDuration>",
        request.external_port,
        request.protocol,
        request.internal_port,
        local_ip,
        xml_escape(&request.description),
        request.lease_secs,
    )
}

fn delete_mapping_body(external_port: u16, protocol: Protocol) -> String {
    format!(
        "<NewRemoteHost></NewRemoteHost>\
         <NewExternalPort>{external_port}</NewExternalPort>\
         <NewProtocol>{protocol}</NewProtocol>"
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn parse_soap_fault(body: &str) -> Option<u16> {
    let re = Regex::new(r"<errorCode>\s*(\d+)\s*</errorCode>").unwrap();
    re.captures(body).and_then(|c| c[1].parse().ok())
}
