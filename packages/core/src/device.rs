//! Device record and its boundary representation.
//!
//! A [`DeviceRecord`] is the registry's snapshot of one attached USB storage
//! device. [`DeviceView`] is the shape handed to external consumers (CLI
//! output, bindings), where every empty or inapplicable value becomes `null`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Snapshot of one device's identity and mount state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Stable identifier for this device instance while it stays attached.
    pub uid: String,
    /// Vendor code (e.g. "0x0781"). Empty when unknown.
    pub vendor_id: String,
    /// Product code (e.g. "0x5581"). Empty when unknown.
    pub product_id: String,
    /// Manufacturer string. `Some("")` means unknown, `None` not applicable.
    pub vendor_str: Option<String>,
    /// Product string. Same convention as `vendor_str`.
    pub product_str: Option<String>,
    /// Serial number. Same convention as `vendor_str`.
    pub serial_str: Option<String>,
    /// Current mount path, if mounted.
    pub mount: Option<PathBuf>,
}

impl DeviceRecord {
    /// Creates an unmounted record with only the uid set.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            ..Self::default()
        }
    }

    /// Sets the vendor and product codes.
    pub fn with_codes(mut self, vendor_id: impl Into<String>, product_id: impl Into<String>) -> Self {
        self.vendor_id = vendor_id.into();
        self.product_id = product_id.into();
        self
    }

    /// Sets the manufacturer string.
    pub fn with_vendor_str(mut self, vendor: impl Into<String>) -> Self {
        self.vendor_str = Some(vendor.into());
        self
    }

    /// Sets the product string.
    pub fn with_product_str(mut self, product: impl Into<String>) -> Self {
        self.product_str = Some(product.into());
        self
    }

    /// Sets the serial number.
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial_str = Some(serial.into());
        self
    }

    /// Sets the mount path.
    pub fn with_mount(mut self, mount: impl Into<PathBuf>) -> Self {
        self.mount = Some(mount.into());
        self
    }

    /// Returns the mount path if it is set and non-empty.
    pub fn mount_path(&self) -> Option<&Path> {
        self.mount
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// Returns true if the device currently has a mount path.
    pub fn is_mounted(&self) -> bool {
        self.mount_path().is_some()
    }

    /// Returns true if `id` names this device by uid or by serial number.
    pub fn matches(&self, id: &str) -> bool {
        self.uid == id || self.serial_str.as_deref().is_some_and(|s| !s.is_empty() && s == id)
    }
}

/// Device information as exposed at the service boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub id: Option<String>,
    pub product_code: Option<String>,
    pub vendor_code: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub mount: Option<String>,
}

/// Maps empty strings to `None`.
fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

impl From<&DeviceRecord> for DeviceView {
    fn from(record: &DeviceRecord) -> Self {
        Self {
            id: non_empty(&record.uid),
            product_code: non_empty(&record.product_id),
            vendor_code: non_empty(&record.vendor_id),
            product: record.product_str.as_deref().and_then(non_empty),
            serial_number: record.serial_str.as_deref().and_then(non_empty),
            manufacturer: record.vendor_str.as_deref().and_then(non_empty),
            mount: record.mount_path().map(|p| p.display().to_string()),
        }
    }
}

impl From<DeviceRecord> for DeviceView {
    fn from(record: DeviceRecord) -> Self {
        Self::from(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_maps_empty_strings_to_null() {
        let record = DeviceRecord {
            uid: "d1".to_string(),
            vendor_id: "0x1".to_string(),
            product_id: String::new(),
            vendor_str: Some(String::new()),
            product_str: None,
            serial_str: Some("AA11".to_string()),
            mount: Some(PathBuf::new()),
        };

        let view = DeviceView::from(&record);
        assert_eq!(view.id.as_deref(), Some("d1"));
        assert_eq!(view.vendor_code.as_deref(), Some("0x1"));
        assert_eq!(view.product_code, None);
        assert_eq!(view.manufacturer, None);
        assert_eq!(view.product, None);
        assert_eq!(view.serial_number.as_deref(), Some("AA11"));
        assert_eq!(view.mount, None);
    }

    #[test]
    fn test_view_serializes_camel_case() {
        let record = DeviceRecord::new("d1")
            .with_codes("0x1", "0x2")
            .with_mount("/media/d1");
        let json = serde_json::to_value(DeviceView::from(&record)).unwrap();

        assert_eq!(json["id"], "d1");
        assert_eq!(json["vendorCode"], "0x1");
        assert_eq!(json["productCode"], "0x2");
        assert_eq!(json["mount"], "/media/d1");
        assert!(json["serialNumber"].is_null());
        assert!(json["manufacturer"].is_null());
    }

    #[test]
    fn test_matches_uid_or_serial() {
        let record = DeviceRecord::new("sdb").with_serial("4C530001");
        assert!(record.matches("sdb"));
        assert!(record.matches("4C530001"));
        assert!(!record.matches("sdc"));

        // An empty serial never matches an empty identifier
        let unknown = DeviceRecord::new("sdc").with_serial("");
        assert!(!unknown.matches(""));
    }

    #[test]
    fn test_empty_mount_is_not_mounted() {
        let record = DeviceRecord::new("sdb").with_mount("");
        assert!(!record.is_mounted());
        assert!(DeviceRecord::new("sdb").with_mount("/run/media/usb").is_mounted());
    }
}
