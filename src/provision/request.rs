//! Provisioning input and output documents.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What to install on the device.
///
/// Read from YAML by the CLI:
///
/// ```yaml
/// image_path: gs://chromeos-image-archive/eve-release/R100-14526.0.0
/// preserve_stateful: true
/// dlc_ids: [sample-dlc]
/// update_firmware: false
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    /// `gs://` directory holding the image artifacts
    pub image_path: String,

    #[serde(default)]
    pub preserve_stateful: bool,

    #[serde(default)]
    pub dlc_ids: Vec<String>,

    #[serde(default)]
    pub update_firmware: bool,

    /// Stop after post-install instead of rebooting into the new image
    #[serde(default)]
    pub prevent_reboot: bool,
}

impl ProvisionRequest {
    pub fn new(image_path: impl Into<String>) -> Self {
        Self {
            image_path: image_path.into(),
            preserve_stateful: false,
            dlc_ids: Vec::new(),
            update_firmware: false,
            prevent_reboot: false,
        }
    }

    pub fn with_preserve_stateful(mut self, preserve: bool) -> Self {
        self.preserve_stateful = preserve;
        self
    }

    pub fn with_dlc(mut self, id: impl Into<String>) -> Self {
        self.dlc_ids.push(id.into());
        self
    }

    pub fn with_update_firmware(mut self, update: bool) -> Self {
        self.update_firmware = update;
        self
    }

    pub fn with_prevent_reboot(mut self, prevent: bool) -> Self {
        self.prevent_reboot = prevent;
        self
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let request: ProvisionRequest = serde_yaml::from_str(contents)
            .map_err(|e| Error::Validation(format!("failed to parse provision request: {}", e)))?;
        request.validate()?;
        Ok(request)
    }

    /// Rejects requests that cannot be served before anything touches the
    /// device.
    pub fn validate(&self) -> Result<()> {
        if !self.image_path.starts_with("gs://") {
            return Err(Error::InvalidSource(format!(
                "only GS copying is implemented, got image path {:?}",
                self.image_path
            )));
        }
        for id in &self.dlc_ids {
            if id.is_empty() || id.contains('/') || id.contains(char::is_whitespace) {
                return Err(Error::Validation(format!("invalid DLC id {:?}", id)));
            }
        }
        Ok(())
    }

    /// Full `gs://` path of an artifact below the image directory.
    pub fn artifact(&self, relative: &str) -> String {
        format!("{}/{}", self.image_path.trim_end_matches('/'), relative)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisionStatus {
    Success,
    ProvisioningFailed,
    FirmwareUpdateFailed,
    RpcFailed,
}

/// Outcome of one provisioning run, written as JSON by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionResponse {
    pub dut: String,
    pub status: ProvisionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProvisionResponse {
    pub fn success(dut: impl Into<String>) -> Self {
        Self {
            dut: dut.into(),
            status: ProvisionStatus::Success,
            failed_state: None,
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ProvisionStatus::Success
    }
}
