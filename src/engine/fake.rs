//! In-memory engine used by unit tests.
//!
//! Mounting creates a minimal offline layout in the mount directory and
//! unmounting empties it again, so filesystem-level checks in the mount
//! manager behave as they would against the real tools.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{
    EngineError, ImageEngine, ImageInfo, MountStatus, MountedImage, ProvisionedAppx,
};

type PackageRule = Box<dyn Fn(&Path) -> Result<(), EngineError> + Send + Sync>;

pub(crate) struct FakeEngine {
    pub(crate) version: String,
    pub(crate) mount_error: Option<EngineError>,
    pub(crate) commit_error: Option<EngineError>,
    pub(crate) health_error: Option<EngineError>,
    pub(crate) driver_error: Option<EngineError>,
    pub(crate) export_error: Option<EngineError>,
    pub(crate) appx: Vec<ProvisionedAppx>,
    package_rule: Option<PackageRule>,
    mounts: Mutex<HashMap<PathBuf, MountedImage>>,
    calls: Mutex<Vec<String>>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            version: "10.0.22631.2861".to_string(),
            mount_error: None,
            commit_error: None,
            health_error: None,
            driver_error: None,
            export_error: None,
            appx: Vec::new(),
            package_rule: None,
            mounts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub(crate) fn with_package_rule(
        mut self,
        rule: impl Fn(&Path) -> Result<(), EngineError> + Send + Sync + 'static,
    ) -> Self {
        self.package_rule = Some(Box::new(rule));
        self
    }

    /// Pretend a previous process left `mount_point` registered with the engine.
    pub(crate) fn register_stale_mount(&self, mount_point: &Path, status: MountStatus) {
        self.mounts.lock().unwrap().insert(
            mount_point.to_path_buf(),
            MountedImage {
                mount_dir: mount_point.to_path_buf(),
                image_file: PathBuf::from("stale.wim"),
                index: 1,
                status,
            },
        );
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub(crate) fn is_mounted(&self, mount_point: &Path) -> bool {
        self.mounts.lock().unwrap().contains_key(mount_point)
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn clear_dir(dir: &Path) {
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                let _ = fs::remove_dir_all(&path);
            } else {
                let _ = fs::remove_file(&path);
            }
        }
    }
}

impl ImageEngine for FakeEngine {
    fn image_info(&self, image: &Path, index: u32) -> Result<ImageInfo, EngineError> {
        self.log(format!("image_info {} {}", image.display(), index));
        Ok(ImageInfo {
            index,
            name: "Windows 11 Pro".to_string(),
            edition: Some("Professional".to_string()),
            architecture: Some("x64".to_string()),
            version: self.version.clone(),
            languages: vec!["en-US".to_string()],
        })
    }

    fn mount(&self, image: &Path, index: u32, mount_point: &Path) -> Result<(), EngineError> {
        self.log(format!("mount {}", mount_point.display()));
        if let Some(err) = &self.mount_error {
            return Err(err.clone());
        }
        let hive_dir = mount_point.join("Windows/System32/config");
        fs::create_dir_all(&hive_dir).map_err(|e| EngineError::local("mount", e.to_string()))?;
        fs::write(hive_dir.join("SOFTWARE"), b"regf")
            .map_err(|e| EngineError::local("mount", e.to_string()))?;
        self.mounts.lock().unwrap().insert(
            mount_point.to_path_buf(),
            MountedImage {
                mount_dir: mount_point.to_path_buf(),
                image_file: image.to_path_buf(),
                index,
                status: MountStatus::Ok,
            },
        );
        Ok(())
    }

    fn unmount(&self, mount_point: &Path, commit: bool) -> Result<(), EngineError> {
        self.log(format!(
            "unmount {} {}",
            mount_point.display(),
            if commit { "commit" } else { "discard" }
        ));
        if commit {
            if let Some(err) = &self.commit_error {
                return Err(err.clone());
            }
        }
        if self.mounts.lock().unwrap().remove(mount_point).is_none() {
            return Err(EngineError::local(
                "unmount",
                format!("nothing mounted at '{}'", mount_point.display()),
            ));
        }
        clear_dir(mount_point);
        Ok(())
    }

    fn mounted_images(&self) -> Result<Vec<MountedImage>, EngineError> {
        Ok(self.mounts.lock().unwrap().values().cloned().collect())
    }

    fn cleanup_mounts(&self) -> Result<(), EngineError> {
        self.log("cleanup".to_string());
        self.mounts
            .lock()
            .unwrap()
            .retain(|_, m| m.status == MountStatus::Ok);
        Ok(())
    }

    fn check_health(&self, mount_point: &Path) -> Result<(), EngineError> {
        self.log(format!("check_health {}", mount_point.display()));
        match &self.health_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn add_driver(&self, _mount_point: &Path, driver: &Path, _recurse: bool) -> Result<usize, EngineError> {
        self.log(format!("add_driver {}", driver.display()));
        match &self.driver_error {
            Some(err) => Err(err.clone()),
            None => Ok(1),
        }
    }

    fn add_package(&self, _mount_point: &Path, package: &Path) -> Result<(), EngineError> {
        self.log(format!("add_package {}", package.display()));
        match &self.package_rule {
            Some(rule) => rule(package),
            None => Ok(()),
        }
    }

    fn expand_package(&self, package: &Path, dest: &Path) -> Result<Vec<PathBuf>, EngineError> {
        self.log(format!("expand {}", package.display()));
        fs::create_dir_all(dest).map_err(|e| EngineError::local("expand", e.to_string()))?;
        let stem = package
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("payload");
        let payload = dest.join(format!("{stem}-payload.cab"));
        let scan = dest.join("WSUSSCAN.cab");
        for file in [&payload, &scan] {
            fs::write(file, b"MSCF").map_err(|e| EngineError::local("expand", e.to_string()))?;
        }
        Ok(vec![payload, scan])
    }

    fn add_capability(&self, _mount_point: &Path, capability: &str, _source: Option<&Path>) -> Result<(), EngineError> {
        self.log(format!("add_capability {capability}"));
        Ok(())
    }

    fn add_provisioned_appx(&self, _mount_point: &Path, package: &Path, _license: Option<&Path>) -> Result<(), EngineError> {
        self.log(format!("add_appx {}", package.display()));
        Ok(())
    }

    fn provisioned_appx(&self, _mount_point: &Path) -> Result<Vec<ProvisionedAppx>, EngineError> {
        Ok(self.appx.clone())
    }

    fn remove_provisioned_appx(&self, _mount_point: &Path, package_name: &str) -> Result<(), EngineError> {
        self.log(format!("remove_appx {package_name}"));
        Ok(())
    }

    fn load_hive(&self, key: &str, _hive_file: &Path) -> Result<(), EngineError> {
        self.log(format!("load_hive {key}"));
        Ok(())
    }

    fn import_registry(&self, reg_file: &Path) -> Result<(), EngineError> {
        self.log(format!("import {}", reg_file.display()));
        Ok(())
    }

    fn unload_hive(&self, key: &str) -> Result<(), EngineError> {
        self.log(format!("unload_hive {key}"));
        Ok(())
    }

    fn export_image(&self, _source: &Path, _index: u32, destination: &Path, _name: Option<&str>) -> Result<(), EngineError> {
        self.log(format!("export {}", destination.display()));
        match &self.export_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
