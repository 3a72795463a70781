use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;

use kiln_core::constants::SUBPROCESS_PRESET_PREFIX;
use kiln_core::{Error, Preset, Result, SubprocessPreset};
use tracing::{debug, warn};

/// Builtin presets compiled into the binary.
pub fn builtin(name: &str) -> Option<Arc<dyn Preset>> {
    match name {
        kiln_ext_copy::PRESET_NAME => Some(Arc::new(kiln_ext_copy::CopyPreset::new())),
        kiln_ext_exec::PRESET_NAME => Some(Arc::new(kiln_ext_exec::ExecPreset::new())),
        _ => None,
    }
}

/// Resolves preset names in order: builtins first, then `kiln-preset-<name>`
/// executables on `PATH`.
pub fn resolve_presets(names: &[String]) -> Result<Vec<Arc<dyn Preset>>> {
    let search_path = std::env::var_os("PATH").unwrap_or_default();
    resolve_presets_in(names, &search_path)
}

pub fn resolve_presets_in(names: &[String], search_path: &OsStr) -> Result<Vec<Arc<dyn Preset>>> {
    names
        .iter()
        .map(|name| {
            if let Some(preset) = builtin(name) {
                return Ok(preset);
            }
            discover_subprocess_preset(name, search_path)
                .ok_or_else(|| Error::UnknownPreset(name.clone()))
        })
        .collect()
}

fn discover_subprocess_preset(name: &str, search_path: &OsStr) -> Option<Arc<dyn Preset>> {
    let binary_name = format!("{SUBPROCESS_PRESET_PREFIX}{name}");
    debug!("probing for subprocess preset: {}", binary_name);

    let Some(binary_path) = find_executable(&binary_name, search_path) else {
        debug!("'{}' not found on PATH", binary_name);
        return None;
    };

    match SubprocessPreset::discover(name, &binary_path) {
        Ok(preset) => Some(Arc::new(preset)),
        Err(e) => {
            warn!("failed to discover preset '{}': {}", name, e);
            None
        }
    }
}

fn find_executable(binary_name: &str, search_path: &OsStr) -> Option<PathBuf> {
    std::env::split_paths(search_path)
        .map(|dir| dir.join(binary_name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn create_mock_binary(dir_path: &std::path::Path, name: &str, manifest_json: &str) {
        let path = dir_path.join(format!("{SUBPROCESS_PRESET_PREFIX}{name}"));

        let script = format!(
            r#"#!/usr/bin/env sh
if [ "$1" = "--discover" ]; then
    echo '{}'
    exit 0
fi
exit 1
"#,
            manifest_json
        );

        fs::write(&path, script).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn builtin_presets_resolve_in_requested_order() {
        let presets = resolve_presets_in(&names(&["exec", "copy"]), OsStr::new("")).unwrap();
        let resolved: Vec<_> = presets.iter().map(|p| p.name()).collect();
        assert_eq!(resolved, vec!["exec", "copy"]);
    }

    #[test]
    fn discovers_subprocess_preset_on_search_path() {
        let dir = tempdir().unwrap();
        create_mock_binary(dir.path(), "sass", r#"{"runners": {"css": ["sass"]}}"#);

        let presets =
            resolve_presets_in(&names(&["copy", "sass"]), dir.path().as_os_str()).unwrap();
        assert_eq!(presets[1].name(), "sass");
    }

    #[test]
    fn failed_discovery_reports_unknown_preset() {
        let dir = tempdir().unwrap();
        create_mock_binary(dir.path(), "broken", "not json");

        let err = resolve_presets_in(&names(&["broken"]), dir.path().as_os_str()).unwrap_err();
        assert_eq!(err.to_string(), "unknown preset 'broken'");

        let err = resolve_presets_in(&names(&["missing"]), dir.path().as_os_str()).unwrap_err();
        assert_eq!(err.to_string(), "unknown preset 'missing'");
    }
}
