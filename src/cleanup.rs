use crate::hardware::Hardware;
use crate::request::InstallRequest;

/// Tear down leftover software RAID before imaging.
///
/// Never fails: a disk that still carries RAID metadata may well be
/// imageable, so problems are only logged.
pub fn cleanup(hardware: &dyn Hardware, request: &InstallRequest) {
    if !request.automated_clean {
        tracing::debug!("Automated cleaning disabled, leaving software RAID alone");
        return;
    }

    if let Err(e) = hardware.delete_software_raid() {
        tracing::warn!("Failed to delete software RAID configuration: {:#}", e);
        return;
    }

    if let Err(e) = hardware.rescan_device(&request.device) {
        tracing::warn!("Failed to rescan {}: {:#}", request.device.display(), e);
    }
}
