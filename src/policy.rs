//! Remote control-plane adapter.
//!
//! The control plane supplies the household's desired device-control
//! snapshot and receives guest notifications. Responses are treated as full
//! replacements of the previous view, never merged incrementally. Any fetch
//! failure is `UpstreamUnavailable` and must never cause existing kernel
//! state to be cleared speculatively.

use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config;
use crate::error::{Error, Result};

/// Desired control state for one household device, keyed by its current IP.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceControl {
    pub ip: Ipv4Addr,
    pub has_fast_entitlement: bool,
    pub age_group: String,
}

#[derive(Debug, Deserialize)]
struct DeviceControlsResponse {
    success: bool,
    #[serde(default)]
    devices: Vec<DeviceControl>,
}

#[derive(Debug, Deserialize)]
struct FastDevice {
    ip: Ipv4Addr,
}

#[derive(Debug, Deserialize)]
struct FastDevicesResponse {
    success: bool,
    #[serde(default)]
    devices: Vec<FastDevice>,
}

#[derive(Debug, Deserialize)]
struct SetupResponse {
    success: bool,
    #[serde(default)]
    household_id: Option<String>,
}

/// Structured guest notification delivered to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuestNotification {
    #[serde(rename = "householdId")]
    pub household_id: String,
    /// Reported hostname of the device.
    #[serde(rename = "deviceInfo")]
    pub device_info: String,
    #[serde(rename = "deviceIP")]
    pub device_ip: Ipv4Addr,
    #[serde(rename = "deviceMAC")]
    pub device_mac: String,
    pub timestamp: i64,
}

/// Current Unix timestamp in seconds.
pub fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Port to the remote control plane.
///
/// The production implementation talks HTTP; tests substitute an in-memory
/// one so reconciliation logic stays independent of the network.
pub trait ControlPlane: Send + Sync {
    /// Fetch the full device-control snapshot for the household.
    fn fetch_device_controls(&self) -> Result<Vec<DeviceControl>>;

    /// Fetch the simplified fast-device list for the household.
    fn fetch_fast_devices(&self) -> Result<Vec<Ipv4Addr>>;

    /// Deliver one guest notification.
    fn notify_guest(&self, notification: &GuestNotification) -> Result<()>;
}

/// Production control-plane client over blocking HTTP with bounded timeouts.
pub struct HttpControlPlane {
    server_url: String,
    household_id: String,
    client: reqwest::blocking::Client,
}

impl HttpControlPlane {
    /// Build a client for the given control plane and household scope.
    pub fn new(server_url: &str, household_id: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(config::HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(config::HTTP_READ_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::UpstreamUnavailable(format!("http client init failed: {e}")))?;
        Ok(Self {
            server_url: server_url.trim_end_matches('/').to_string(),
            household_id: household_id.to_string(),
            client,
        })
    }

    fn get_body(&self, endpoint: &str) -> Result<String> {
        let url = format!(
            "{}/{}?household_id={}",
            self.server_url, endpoint, self.household_id
        );
        let response = self.client.get(&url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamUnavailable(format!(
                "{endpoint} returned HTTP {status}"
            )));
        }
        Ok(response.text()?)
    }

    /// One-shot provisioning call: registers the router and returns the
    /// household id to persist in the settings document.
    pub fn register(server_url: &str, email: &str, router_mac: &str) -> Result<String> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(config::HTTP_CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(config::HTTP_READ_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::UpstreamUnavailable(format!("http client init failed: {e}")))?;
        let url = format!("{}/setup", server_url.trim_end_matches('/'));
        let response = client
            .post(&url)
            .json(&serde_json::json!({ "email": email, "router_mac": router_mac }))
            .send()?;
        let body: SetupResponse = response
            .json()
            .map_err(|e| Error::UpstreamUnavailable(format!("malformed setup response: {e}")))?;
        match (body.success, body.household_id) {
            (true, Some(id)) if !id.trim().is_empty() => Ok(id),
            _ => Err(Error::UpstreamUnavailable(
                "setup rejected by control plane".into(),
            )),
        }
    }
}

/// Parse a device-controls response body, requiring the explicit success
/// indicator.
pub fn parse_device_controls(body: &str) -> Result<Vec<DeviceControl>> {
    let parsed: DeviceControlsResponse = serde_json::from_str(body)
        .map_err(|e| Error::UpstreamUnavailable(format!("malformed device-controls body: {e}")))?;
    if !parsed.success {
        return Err(Error::UpstreamUnavailable(
            "device-controls response did not indicate success".into(),
        ));
    }
    Ok(parsed.devices)
}

/// Parse a fast-devices response body.
pub fn parse_fast_devices(body: &str) -> Result<Vec<Ipv4Addr>> {
    let parsed: FastDevicesResponse = serde_json::from_str(body)
        .map_err(|e| Error::UpstreamUnavailable(format!("malformed fast-devices body: {e}")))?;
    if !parsed.success {
        return Err(Error::UpstreamUnavailable(
            "fast-devices response did not indicate success".into(),
        ));
    }
    Ok(parsed.devices.into_iter().map(|d| d.ip).collect())
}

impl ControlPlane for HttpControlPlane {
    fn fetch_device_controls(&self) -> Result<Vec<DeviceControl>> {
        parse_device_controls(&self.get_body("device-controls")?)
    }

    fn fetch_fast_devices(&self) -> Result<Vec<Ipv4Addr>> {
        parse_fast_devices(&self.get_body("fast-devices")?)
    }

    fn notify_guest(&self, notification: &GuestNotification) -> Result<()> {
        let url = format!("{}/new-guest", self.server_url);
        let response = self
            .client
            .post(&url)
            .json(notification)
            .send()
            .map_err(|e| Error::NotificationDelivery(format!("new-guest POST failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::NotificationDelivery(format!(
                "new-guest returned HTTP {status}"
            )));
        }
        Ok(())
    }
}

/// Read-only wrapper for dry runs: fetches pass through, guest
/// notifications are logged instead of delivered.
pub struct DryRunControlPlane<P>(P);

impl<P: ControlPlane> DryRunControlPlane<P> {
    pub fn new(inner: P) -> Self {
        Self(inner)
    }
}

impl<P: ControlPlane> ControlPlane for DryRunControlPlane<P> {
    fn fetch_device_controls(&self) -> Result<Vec<DeviceControl>> {
        self.0.fetch_device_controls()
    }

    fn fetch_fast_devices(&self) -> Result<Vec<Ipv4Addr>> {
        self.0.fetch_fast_devices()
    }

    fn notify_guest(&self, notification: &GuestNotification) -> Result<()> {
        tracing::info!(
            "dry run: would notify control plane about guest {} ({})",
            notification.device_ip,
            notification.device_mac
        );
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_controls_success() {
        let body = r#"{"success":true,"devices":[
            {"ip":"192.168.1.10","hasFastEntitlement":true,"ageGroup":"adult"},
            {"ip":"192.168.1.11","hasFastEntitlement":false,"ageGroup":"child"}
        ]}"#;
        let devices = parse_device_controls(body).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].ip, Ipv4Addr::new(192, 168, 1, 10));
        assert!(devices[0].has_fast_entitlement);
        assert_eq!(devices[1].age_group, "child");
    }

    #[test]
    fn test_parse_device_controls_empty_devices() {
        let devices = parse_device_controls(r#"{"success":true}"#).unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn test_parse_device_controls_missing_success_flag() {
        let err = parse_device_controls(r#"{"devices":[]}"#).unwrap_err();
        assert_eq!(err.kind(), "UpstreamUnavailable");
    }

    #[test]
    fn test_parse_device_controls_explicit_failure() {
        let err = parse_device_controls(r#"{"success":false,"devices":[]}"#).unwrap_err();
        assert_eq!(err.kind(), "UpstreamUnavailable");
    }

    #[test]
    fn test_parse_device_controls_malformed_body() {
        let err = parse_device_controls("<html>502</html>").unwrap_err();
        assert_eq!(err.kind(), "UpstreamUnavailable");
    }

    #[test]
    fn test_parse_fast_devices() {
        let body = r#"{"success":true,"devices":[{"ip":"192.168.1.20"},{"ip":"192.168.1.21"}]}"#;
        let ips = parse_fast_devices(body).unwrap();
        assert_eq!(
            ips,
            vec![Ipv4Addr::new(192, 168, 1, 20), Ipv4Addr::new(192, 168, 1, 21)]
        );
    }

    #[test]
    fn test_parse_fast_devices_failure_flag() {
        let err = parse_fast_devices(r#"{"success":false}"#).unwrap_err();
        assert_eq!(err.kind(), "UpstreamUnavailable");
    }

    #[test]
    fn test_guest_notification_wire_field_names() {
        let notification = GuestNotification {
            household_id: "h-1234".into(),
            device_info: "laptop".into(),
            device_ip: Ipv4Addr::new(192, 168, 1, 50),
            device_mac: "aa:bb:cc:dd:ee:ff".into(),
            timestamp: 1700000000,
        };
        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["householdId"], "h-1234");
        assert_eq!(json["deviceInfo"], "laptop");
        assert_eq!(json["deviceIP"], "192.168.1.50");
        assert_eq!(json["deviceMAC"], "aa:bb:cc:dd:ee:ff");
        assert_eq!(json["timestamp"], 1700000000);
    }

    #[test]
    fn test_http_fetch_unreachable_server_is_upstream_unavailable() {
        // Port 1 is essentially never listening; connect fails fast.
        let plane = HttpControlPlane::new("http://127.0.0.1:1", "h-1").unwrap();
        let err = plane.fetch_device_controls().unwrap_err();
        assert_eq!(err.kind(), "UpstreamUnavailable");
    }

    #[test]
    fn test_http_notify_unreachable_server_is_notification_delivery() {
        let plane = HttpControlPlane::new("http://127.0.0.1:1", "h-1").unwrap();
        let notification = GuestNotification {
            household_id: "h-1".into(),
            device_info: "laptop".into(),
            device_ip: Ipv4Addr::new(192, 168, 1, 50),
            device_mac: "aa:bb:cc:dd:ee:ff".into(),
            timestamp: 0,
        };
        let err = plane.notify_guest(&notification).unwrap_err();
        assert_eq!(err.kind(), "NotificationDelivery");
    }

    #[test]
    fn test_unix_timestamp_is_positive() {
        assert!(unix_timestamp() > 1_600_000_000);
    }

    #[test]
    fn test_dry_run_plane_never_delivers_notifications() {
        let inner = testing::RecordingControlPlane::with_controls(vec![]);
        let plane = DryRunControlPlane::new(inner);

        let notification = GuestNotification {
            household_id: "h-1".into(),
            device_info: "laptop".into(),
            device_ip: Ipv4Addr::new(192, 168, 1, 50),
            device_mac: "aa:bb:cc:dd:ee:ff".into(),
            timestamp: 0,
        };
        plane.notify_guest(&notification).unwrap();
        assert!(plane.0.notifications.lock().unwrap().is_empty());
        assert!(plane.fetch_device_controls().unwrap().is_empty());
    }
}
