//! Device-side building blocks of an OS install.
//!
//! [`ProvisionContext`] carries the request, the adapter and whatever the
//! run learned about the device so far. Its methods each map to one shell
//! interaction with the device; sequencing and rollback live in the state
//! machine.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, ErrorContext, Result};
use crate::provision::partition::{partition_info, root_part_number, DlcSlot, PartitionInfo};
use crate::provision::request::ProvisionRequest;
use crate::remote::{CacheSource, DutAdapter};

pub const DLC_CACHE_DIR: &str = "/var/cache/dlc";
pub const DLC_LIB_DIR: &str = "/var/lib/dlcservice/dlc";
pub const DLC_PACKAGE: &str = "package";
pub const DLC_IMAGE: &str = "dlc.img";
pub const DLC_VERIFIED: &str = "verified";

pub const STATEFUL_PATH: &str = "/mnt/stateful_partition";
pub const UPDATE_STATEFUL_FILE_PATH: &str = "/mnt/stateful_partition/.update_available";
pub const FACTORY_RESET_FILE_PATH: &str = "/mnt/stateful_partition/factory_install_reset";

pub const KERNEL_IMAGE: &str = "full_dev_part_KERN.bin.gz";
pub const ROOT_IMAGE: &str = "full_dev_part_ROOT.bin.gz";
pub const STATEFUL_IMAGE: &str = "stateful.tgz";

pub const FIRMWARE_UPDATER_PATH: &str = "/usr/sbin/chromeos-firmwareupdate";

const DEFAULT_REBOOT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_FIRMWARE_REBOOT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_STABILIZE_TIMEOUT: Duration = Duration::from_secs(120);
const STABILIZE_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct ProvisionContext {
    adapter: Arc<DutAdapter>,
    request: ProvisionRequest,
    reboot_timeout: Duration,
    firmware_reboot_timeout: Duration,
    stabilize_timeout: Duration,
    stabilize_poll: Duration,
    partitions: Option<PartitionInfo>,
}

impl ProvisionContext {
    pub fn new(adapter: Arc<DutAdapter>, request: ProvisionRequest) -> Self {
        Self {
            adapter,
            request,
            reboot_timeout: DEFAULT_REBOOT_TIMEOUT,
            firmware_reboot_timeout: DEFAULT_FIRMWARE_REBOOT_TIMEOUT,
            stabilize_timeout: DEFAULT_STABILIZE_TIMEOUT,
            stabilize_poll: STABILIZE_POLL_INTERVAL,
            partitions: None,
        }
    }

    pub fn with_reboot_timeout(mut self, timeout: Duration) -> Self {
        self.reboot_timeout = timeout;
        self
    }

    pub fn with_firmware_reboot_timeout(mut self, timeout: Duration) -> Self {
        self.firmware_reboot_timeout = timeout;
        self
    }

    /// Bounds and pacing of the wait for system services after a firmware
    /// update.
    pub fn with_stabilize(mut self, timeout: Duration, poll: Duration) -> Self {
        self.stabilize_timeout = timeout;
        self.stabilize_poll = poll;
        self
    }

    pub fn adapter(&self) -> &Arc<DutAdapter> {
        &self.adapter
    }

    pub fn request(&self) -> &ProvisionRequest {
        &self.request
    }

    pub fn reboot_timeout(&self) -> Duration {
        self.reboot_timeout
    }

    pub fn firmware_reboot_timeout(&self) -> Duration {
        self.firmware_reboot_timeout
    }

    /// Layout probed at the start of the run.
    pub fn partitions(&self) -> Result<&PartitionInfo> {
        self.partitions
            .as_ref()
            .ok_or_else(|| Error::Validation("partition layout has not been probed".to_string()))
    }

    /// Root partition number the run started from.
    pub fn root_part(&self) -> Result<String> {
        root_part_number(&self.partitions()?.active_root)
    }

    // Root and disk

    pub async fn get_root(&self) -> Result<String> {
        let root = self
            .adapter
            .run_cmd("rootdev", &["-s"])
            .await
            .context("failed to get current root")?;
        Ok(root.trim().to_string())
    }

    pub async fn get_root_disk(&self) -> Result<String> {
        let disk = self
            .adapter
            .run_cmd("rootdev", &["-s", "-d"])
            .await
            .context("failed to get root disk")?;
        Ok(disk.trim().to_string())
    }

    pub async fn probe_partitions(&mut self) -> Result<PartitionInfo> {
        let root = self.get_root().await?;
        let disk = self.get_root_disk().await?;
        let part = root_part_number(&root).context("failed to get root part number")?;
        let info = partition_info(&root, &disk, &part)?;
        info!(
            "Booted from {}, installing to {} / {}",
            info.active_root, info.inactive_kernel, info.inactive_root
        );
        self.partitions = Some(info.clone());
        Ok(info)
    }

    // Daemons

    pub async fn stop_system_daemons(&self) -> Result<()> {
        self.adapter
            .run_cmd("stop", &["ui"])
            .await
            .context("failed to stop UI daemon")?;
        self.adapter
            .run_cmd("stop", &["update-engine"])
            .await
            .context("failed to stop update-engine daemon")?;
        Ok(())
    }

    // Stateful

    pub async fn wipe_stateful(&self) -> Result<()> {
        self.adapter
            .run_cmd("echo", &["'fast keepimg'", ">", FACTORY_RESET_FILE_PATH])
            .await
            .context("failed to write to factory reset file")?;
        Ok(())
    }

    pub async fn revert_wipe_stateful(&self) -> Result<()> {
        self.adapter
            .run_cmd("rm", &["-f", FACTORY_RESET_FILE_PATH])
            .await
            .context("failed to remove factory reset file")?;
        Ok(())
    }

    /// Unpacks the stateful image; finalized by the next boot.
    ///
    /// A partial unpack is cleaned up before the error is returned.
    pub async fn install_stateful(&self) -> Result<()> {
        let url = self
            .adapter
            .copy_data(&CacheSource::GsFile(self.request.artifact(STATEFUL_IMAGE)))
            .context("failed to get GS Cache URL")?;

        let clear = format!(
            "rm -rf {} {}/var_new {}/dev_image_new",
            UPDATE_STATEFUL_FILE_PATH, STATEFUL_PATH, STATEFUL_PATH
        );
        let unpack = format!(
            "curl {} | tar --ignore-command-error --overwrite --directory={} -xzf -",
            url, STATEFUL_PATH
        );
        let mark = format!("echo -n clobber > {}", UPDATE_STATEFUL_FILE_PATH);

        if let Err(e) = self
            .adapter
            .run_cmd("", &[clear.as_str(), "&&", unpack.as_str(), "&&", mark.as_str()])
            .await
        {
            if let Err(revert) = self.revert_stateful_install().await {
                warn!("Failed to clean up partial stateful install: {}", revert);
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn revert_stateful_install(&self) -> Result<()> {
        let var_new = format!("{}/var_new", STATEFUL_PATH);
        let dev_image_new = format!("{}/dev_image_new", STATEFUL_PATH);
        self.adapter
            .run_cmd(
                "rm",
                &["-rf", var_new.as_str(), dev_image_new.as_str(), UPDATE_STATEFUL_FILE_PATH],
            )
            .await
            .context("failed to revert stateful installation")?;
        Ok(())
    }

    // Kernel and root

    /// Writes kernel and root images to the inactive slot concurrently.
    ///
    /// Both writes always run to completion; every failure is reported.
    pub async fn install_partitions(&self) -> Result<()> {
        let info = self.partitions()?;
        let (kernel, root) = tokio::join!(
            self.install_zipped_image(KERNEL_IMAGE, &info.inactive_kernel),
            self.install_zipped_image(ROOT_IMAGE, &info.inactive_root),
        );

        let errors: Vec<Error> = [
            kernel.context("failed to install kernel"),
            root.context("failed to install root"),
        ]
        .into_iter()
        .filter_map(|r| r.err())
        .collect();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Multiple(errors))
        }
    }

    pub async fn install_zipped_image(&self, image: &str, output: &str) -> Result<()> {
        let url = self
            .adapter
            .copy_data(&CacheSource::GsFile(self.request.artifact(image)))
            .context("failed to get GS Cache URL")?;
        let dd = format!("dd of={} obs=2M", output);
        debug!("Writing {} to {}", image, output);
        self.adapter
            .run_cmd("curl", &[url.as_str(), "|", "gzip -d", "|", dd.as_str()])
            .await?;
        Ok(())
    }

    // Post install

    pub async fn post_install(&self) -> Result<()> {
        let inactive_root = &self.partitions()?.inactive_root;
        let mount = format!("mount -o ro {} ${{tmpmnt}}", inactive_root);
        let postinst = format!("${{tmpmnt}}/postinst {}", inactive_root);
        self.adapter
            .run_cmd(
                "",
                &[
                    "tmpmnt=$(mktemp -d)",
                    "&&",
                    mount.as_str(),
                    "&&",
                    postinst.as_str(),
                    "&&",
                    "{ umount ${tmpmnt} || true; }",
                    "&&",
                    "{ rmdir ${tmpmnt} || true; }",
                ],
            )
            .await?;
        Ok(())
    }

    /// Marks the currently booted root as the one to boot again.
    pub async fn revert_post_install(&self) -> Result<()> {
        let active_root = &self.partitions()?.active_root;
        self.adapter
            .run_cmd("/postinst", &[active_root.as_str(), "2>&1"])
            .await
            .context("failed to revert postinst")?;
        Ok(())
    }

    pub async fn clear_tpm(&self) -> Result<()> {
        self.adapter
            .run_cmd("crossystem", &["clear_tpm_owner_request=1"])
            .await?;
        Ok(())
    }

    pub async fn revert_clear_tpm(&self) -> Result<()> {
        self.adapter
            .run_cmd("crossystem", &["clear_tpm_owner_request=0"])
            .await?;
        Ok(())
    }

    pub async fn reboot(&self, timeout: Duration) -> Result<()> {
        let output = self.adapter.restart(&[], timeout).await?;
        if !output.trim().is_empty() {
            debug!("reboot: {}", output.trim());
        }
        Ok(())
    }

    // DLC

    /// Clears verified marks of every DLC in the inactive slot.
    ///
    /// dlcservice is stopped for the duration and started again on every
    /// path out of here once it was stopped.
    pub async fn clear_dlc_artifacts(&self) -> Result<()> {
        let exists = self
            .adapter
            .path_exists(DLC_LIB_DIR)
            .await
            .context("failed path existence")?;
        if !exists {
            return Err(Error::NotFound(format!("DLC path {}", DLC_LIB_DIR)));
        }
        let inactive = DlcSlot::inactive_for(&self.root_part()?)?;

        if let Err(e) = self.adapter.run_cmd("stop", &["dlcservice"]).await {
            warn!("clear DLC artifacts: failed to stop dlcservice daemon, {}", e);
        }
        let dlcservice = StoppedDaemon::new(Arc::clone(&self.adapter), "dlcservice");

        let marks = format!("{}/*/*/{}/{}", DLC_CACHE_DIR, inactive, DLC_VERIFIED);
        let cleared = self
            .adapter
            .run_cmd("rm", &["-f", marks.as_str()])
            .await
            .context("failed remove inactive verified DLCs");

        dlcservice.start().await;
        cleared.map(|_| ())
    }

    /// Checks the verified marker; never cached.
    pub async fn is_dlc_verified(&self, id: &str, slot: DlcSlot) -> Result<bool> {
        let marker = format!("{}/{}/{}/{}", DLC_LIB_DIR, id, slot, DLC_VERIFIED);
        self.adapter
            .path_exists(&marker)
            .await
            .context(format!("failed to check if DLC {} is verified", id))
    }

    /// Installs one DLC image into `slot`. Returns false when the package was
    /// already verified and nothing was transferred.
    pub async fn install_dlc(&self, id: &str, slot: DlcSlot) -> Result<bool> {
        if self
            .is_dlc_verified(id, slot)
            .await
            .context("failed is DLC verified check")?
        {
            info!("provision DLC {} skipped as already verified", id);
            return Ok(false);
        }

        let source = self
            .request
            .artifact(&format!("dlc/{}/{}/{}", id, DLC_PACKAGE, DLC_IMAGE));
        let url = self
            .adapter
            .copy_data(&CacheSource::GsFile(source))
            .context("failed to get GS Cache server")?;

        let slot_dir = format!("{}/{}/{}/{}", DLC_CACHE_DIR, id, DLC_PACKAGE, slot);
        let image = format!("{}/{}", slot_dir, DLC_IMAGE);
        self.adapter
            .run_cmd(
                "",
                &[
                    "mkdir",
                    "-p",
                    slot_dir.as_str(),
                    "&&",
                    "curl",
                    "--output",
                    image.as_str(),
                    url.as_str(),
                ],
            )
            .await
            .context(format!("failed to provision DLC {}", id))?;
        info!("Provisioned DLC {} into {}", id, slot);
        Ok(true)
    }

    /// Installs every requested DLC into the inactive slot, returning how
    /// many were transferred.
    pub async fn install_dlcs(&self) -> Result<usize> {
        let slot = DlcSlot::inactive_for(&self.root_part()?)?;
        let mut transferred = 0;
        for id in &self.request.dlc_ids {
            if self.install_dlc(id, slot).await? {
                transferred += 1;
            }
        }
        Ok(transferred)
    }

    // Firmware

    pub async fn firmware_updater_exists(&self) -> Result<bool> {
        self.adapter
            .path_exists(FIRMWARE_UPDATER_PATH)
            .await
            .context("failed to check firmware updater existence")
    }

    /// Polls until system services report running.
    pub async fn wait_for_stabilize(&self) -> Result<()> {
        let deadline = Instant::now() + self.stabilize_timeout;
        loop {
            let status = self.adapter.run_cmd("status", &["system-services"]).await;
            match status {
                Ok(out) if out.contains("start/running") => return Ok(()),
                Ok(out) => debug!("system-services not ready: {}", out.trim()),
                Err(e) => debug!("system-services status unavailable: {}", e),
            }
            if Instant::now() + self.stabilize_poll > deadline {
                return Err(Error::Validation(format!(
                    "system services did not start within {:?}",
                    self.stabilize_timeout
                )));
            }
            tokio::time::sleep(self.stabilize_poll).await;
        }
    }

    pub async fn run_firmware_updater(&self) -> Result<()> {
        let output = self
            .adapter
            .run_cmd_combined_output(FIRMWARE_UPDATER_PATH, &["--wp=1", "--mode=autoupdate"])
            .await?;
        for line in output.lines() {
            debug!("firmware updater: {}", line);
        }
        Ok(())
    }

    /// Returns the slot the next boot will try when it differs from the
    /// active one.
    pub async fn check_firmware_slot(&self) -> Result<Option<String>> {
        let active = self.crossystem("mainfw_act").await?;
        let next = self.crossystem("fw_try_next").await?;
        if active == next {
            Ok(None)
        } else {
            info!("Firmware slot changes from {} to {}", active, next);
            Ok(Some(next))
        }
    }

    pub async fn verify_firmware(&self, expected_slot: Option<&str>) -> Result<()> {
        if let Some(expected) = expected_slot {
            let active = self.crossystem("mainfw_act").await?;
            if active != expected {
                return Err(Error::Validation(format!(
                    "booted firmware slot {}, expected {}",
                    active, expected
                )));
            }
        }
        let result = self.crossystem("fw_result").await?;
        if result == "failure" {
            return Err(Error::Validation("firmware reports fw_result=failure".to_string()));
        }
        Ok(())
    }

    async fn crossystem(&self, key: &str) -> Result<String> {
        let value = self
            .adapter
            .run_cmd("crossystem", &[key])
            .await
            .context(format!("failed to read crossystem {}", key))?;
        Ok(value.trim().to_string())
    }

    // Verification

    /// Checks that the device booted from the slot this run installed to.
    pub async fn verify_active_root(&self) -> Result<()> {
        let expected = root_part_number(&self.partitions()?.inactive_root)?;
        let root = self.get_root().await?;
        let booted = root_part_number(&root)?;
        if booted != expected {
            return Err(Error::Validation(format!(
                "device booted from root partition {}, expected {}",
                booted, expected
            )));
        }
        Ok(())
    }

    /// Checks that every requested DLC is verified in the now active slot.
    pub async fn verify_dlcs(&self) -> Result<()> {
        let installed_root = root_part_number(&self.partitions()?.inactive_root)?;
        let slot = DlcSlot::active_for(&installed_root)?;
        for id in &self.request.dlc_ids {
            if !self.is_dlc_verified(id, slot).await? {
                return Err(Error::Validation(format!(
                    "DLC {} is not verified in {}",
                    id, slot
                )));
            }
        }
        Ok(())
    }
}

/// An upstart job that was stopped and must be started again.
///
/// Dropping the guard without calling [`start`](Self::start), e.g. when the
/// surrounding future is cancelled, starts the job on a detached task.
struct StoppedDaemon {
    adapter: Arc<DutAdapter>,
    name: &'static str,
    armed: bool,
}

impl StoppedDaemon {
    fn new(adapter: Arc<DutAdapter>, name: &'static str) -> Self {
        Self {
            adapter,
            name,
            armed: true,
        }
    }

    async fn start(mut self) {
        self.armed = false;
        if let Err(e) = self.adapter.run_cmd("start", &[self.name]).await {
            warn!("failed to start {} daemon, {}", self.name, e);
        }
    }
}

impl Drop for StoppedDaemon {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("{} left stopped, no runtime to start it from", self.name);
            return;
        };
        let adapter = Arc::clone(&self.adapter);
        let name = self.name;
        debug!("Starting {} after cancellation", name);
        handle.spawn(async move {
            if let Err(e) = adapter.run_cmd("start", &[name]).await {
                warn!("failed to start {} daemon, {}", name, e);
            }
        });
    }
}
