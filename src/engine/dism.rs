//! [`ImageEngine`] backed by the Windows servicing tools.
//!
//! - `dism.exe` for mount, package, driver, capability, appx and export work
//! - `reg.exe` for offline hive load/import/unload
//! - `expand.exe` for unwrapping wrapped update packages

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use super::command::ToolCommand;
use super::parse::{
    parse_driver_count, parse_image_info, parse_mounted_images, parse_provisioned_appx,
};
use super::{EngineError, ImageEngine, ImageInfo, MountedImage, ProvisionedAppx};

/// Tool locations for [`DismEngine`].
#[derive(Debug, Clone)]
pub struct DismEngine {
    dism: PathBuf,
    reg: PathBuf,
    expand: PathBuf,
    log_path: Option<PathBuf>,
}

impl Default for DismEngine {
    fn default() -> Self {
        Self {
            dism: PathBuf::from("dism"),
            reg: PathBuf::from("reg"),
            expand: PathBuf::from("expand"),
            log_path: None,
        }
    }
}

impl DismEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve tools from `PATH`, falling back to bare names.
    pub fn from_path() -> Self {
        let resolve = |name: &str| which::which(name).unwrap_or_else(|_| PathBuf::from(name));
        Self {
            dism: resolve("dism"),
            reg: resolve("reg"),
            expand: resolve("expand"),
            log_path: None,
        }
    }

    /// Ask DISM to write its own log alongside the run report.
    pub fn with_log_path(mut self, path: PathBuf) -> Self {
        self.log_path = Some(path);
        self
    }

    fn dism(&self, operation: &'static str) -> ToolCommand {
        let cmd = ToolCommand::new(&self.dism, operation)
            .flag("English")
            .flag("NoRestart");
        match &self.log_path {
            Some(log) => cmd.switch_path("LogPath", log),
            None => cmd,
        }
    }

    fn offline(&self, operation: &'static str, mount_point: &Path) -> ToolCommand {
        self.dism(operation).switch_path("Image", mount_point)
    }
}

impl ImageEngine for DismEngine {
    fn image_info(&self, image: &Path, index: u32) -> Result<ImageInfo, EngineError> {
        let out = self
            .dism("get-image-info")
            .flag("Get-ImageInfo")
            .switch_path("ImageFile", image)
            .switch("Index", index)
            .run()?;
        parse_image_info(&out.stdout).ok_or_else(|| {
            EngineError::local(
                "get-image-info",
                format!(
                    "could not parse image details for '{}' index {}",
                    image.display(),
                    index
                ),
            )
        })
    }

    fn mount(&self, image: &Path, index: u32, mount_point: &Path) -> Result<(), EngineError> {
        info!(image = %image.display(), index, mount_point = %mount_point.display(), "mounting image");
        fs::create_dir_all(mount_point).map_err(|e| {
            EngineError::local(
                "mount",
                format!("creating mount directory '{}': {}", mount_point.display(), e),
            )
        })?;
        self.dism("mount")
            .flag("Mount-Image")
            .switch_path("ImageFile", image)
            .switch("Index", index)
            .switch_path("MountDir", mount_point)
            .run()?;
        Ok(())
    }

    fn unmount(&self, mount_point: &Path, commit: bool) -> Result<(), EngineError> {
        info!(mount_point = %mount_point.display(), commit, "unmounting image");
        self.dism(if commit { "commit" } else { "discard" })
            .flag("Unmount-Image")
            .switch_path("MountDir", mount_point)
            .flag(if commit { "Commit" } else { "Discard" })
            .run()?;
        Ok(())
    }

    fn mounted_images(&self) -> Result<Vec<MountedImage>, EngineError> {
        let out = self
            .dism("get-mounted-images")
            .flag("Get-MountedImageInfo")
            .run()?;
        Ok(parse_mounted_images(&out.stdout))
    }

    fn cleanup_mounts(&self) -> Result<(), EngineError> {
        let out = self.dism("cleanup-mountpoints").flag("Cleanup-Mountpoints").run()?;
        debug!(output = %out.stdout.trim(), "mount point cleanup finished");
        Ok(())
    }

    fn check_health(&self, mount_point: &Path) -> Result<(), EngineError> {
        let software = mount_point.join("Windows/System32/config/SOFTWARE");
        if !software.is_file() {
            return Err(EngineError::local(
                "check-health",
                format!("offline SOFTWARE hive missing at '{}'", software.display()),
            ));
        }
        self.offline("check-health", mount_point)
            .flag("Get-CurrentEdition")
            .run()?;
        Ok(())
    }

    fn add_driver(&self, mount_point: &Path, driver: &Path, recurse: bool) -> Result<usize, EngineError> {
        let out = self
            .offline("add-driver", mount_point)
            .flag("Add-Driver")
            .switch_path("Driver", driver)
            .flag_if("Recurse", recurse)
            .run()?;
        Ok(parse_driver_count(&out.stdout))
    }

    fn add_package(&self, mount_point: &Path, package: &Path) -> Result<(), EngineError> {
        self.offline("add-package", mount_point)
            .flag("Add-Package")
            .switch_path("PackagePath", package)
            .run()?;
        Ok(())
    }

    fn expand_package(&self, package: &Path, dest: &Path) -> Result<Vec<PathBuf>, EngineError> {
        fs::create_dir_all(dest).map_err(|e| {
            EngineError::local(
                "expand",
                format!("creating expansion directory '{}': {}", dest.display(), e),
            )
        })?;
        ToolCommand::new(&self.expand, "expand")
            .arg("-F:*")
            .arg(package.as_os_str())
            .arg(dest.as_os_str())
            .run()?;

        let mut files: Vec<PathBuf> = WalkDir::new(dest)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        files.sort();
        Ok(files)
    }

    fn add_capability(&self, mount_point: &Path, capability: &str, source: Option<&Path>) -> Result<(), EngineError> {
        let cmd = self
            .offline("add-capability", mount_point)
            .flag("Add-Capability")
            .switch("CapabilityName", capability);
        let cmd = match source {
            Some(src) => cmd.switch_path("Source", src).flag("LimitAccess"),
            None => cmd,
        };
        cmd.run()?;
        Ok(())
    }

    fn add_provisioned_appx(&self, mount_point: &Path, package: &Path, license: Option<&Path>) -> Result<(), EngineError> {
        let cmd = self
            .offline("add-appx", mount_point)
            .flag("Add-ProvisionedAppxPackage")
            .switch_path("PackagePath", package);
        let cmd = match license {
            Some(lic) => cmd.switch_path("LicensePath", lic),
            None => cmd.flag("SkipLicense"),
        };
        cmd.run()?;
        Ok(())
    }

    fn provisioned_appx(&self, mount_point: &Path) -> Result<Vec<ProvisionedAppx>, EngineError> {
        let out = self
            .offline("list-appx", mount_point)
            .flag("Get-ProvisionedAppxPackages")
            .run()?;
        Ok(parse_provisioned_appx(&out.stdout))
    }

    fn remove_provisioned_appx(&self, mount_point: &Path, package_name: &str) -> Result<(), EngineError> {
        self.offline("remove-appx", mount_point)
            .flag("Remove-ProvisionedAppxPackage")
            .switch("PackageName", package_name)
            .run()?;
        Ok(())
    }

    fn load_hive(&self, key: &str, hive_file: &Path) -> Result<(), EngineError> {
        ToolCommand::new(&self.reg, "reg-load")
            .arg("load")
            .arg(format!("HKLM\\{key}"))
            .arg(hive_file.as_os_str())
            .run()?;
        Ok(())
    }

    fn import_registry(&self, reg_file: &Path) -> Result<(), EngineError> {
        ToolCommand::new(&self.reg, "reg-import")
            .arg("import")
            .arg(reg_file.as_os_str())
            .run()?;
        Ok(())
    }

    fn unload_hive(&self, key: &str) -> Result<(), EngineError> {
        ToolCommand::new(&self.reg, "reg-unload")
            .arg("unload")
            .arg(format!("HKLM\\{key}"))
            .run()?;
        Ok(())
    }

    fn export_image(&self, source: &Path, index: u32, destination: &Path, name: Option<&str>) -> Result<(), EngineError> {
        info!(
            source = %source.display(),
            index,
            destination = %destination.display(),
            "exporting image"
        );
        let cmd = self
            .dism("export")
            .flag("Export-Image")
            .switch_path("SourceImageFile", source)
            .switch("SourceIndex", index)
            .switch_path("DestinationImageFile", destination)
            .switch("Compress", "max")
            .flag("CheckIntegrity");
        let cmd = match name {
            Some(n) => cmd.arg(format!("/DestinationName:{n}")),
            None => cmd,
        };
        cmd.run()?;
        Ok(())
    }
}
