//! Toolchain configuration

use crate::{Result, SandccError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for a toolchain instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Directory the asset files are loaded from
    pub assets_dir: PathBuf,

    /// Asset names
    pub memfs_module: String,
    pub compiler_module: String,
    pub linker_module: String,
    pub sysroot_archive: String,

    /// Optimization level passed as `-O<level>`
    pub optimization: String,

    /// Pass `-Werror` to the compiler
    pub warnings_as_errors: bool,

    pub c_standard: String,
    pub cxx_standard: String,

    /// Arguments every compile starts with
    pub clang_args: Vec<String>,

    /// Guest stack size in bytes
    pub stack_size: u32,

    /// Library directory inside the sysroot
    pub libdir: String,

    /// Environment variables (`KEY=VALUE`) visible to guests
    pub environment: Vec<String>,

    /// Export called once per frame on scheduled programs
    pub frame_export: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            assets_dir: default_assets_dir(),
            memfs_module: "memfs.wasm".into(),
            compiler_module: "clang.wasm".into(),
            linker_module: "lld.wasm".into(),
            sysroot_archive: "sysroot.tar".into(),
            optimization: "2".into(),
            warnings_as_errors: true,
            c_standard: "c11".into(),
            cxx_standard: "c++17".into(),
            clang_args: [
                "-disable-free",
                "-isysroot",
                "/",
                "-internal-isystem",
                "/include",
                "-internal-isystem",
                "/lib/clang/8.0.1/include",
                "-ferror-limit",
                "19",
                "-fmessage-length",
                "80",
                "-fcolor-diagnostics",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            stack_size: 1024 * 1024, // 1MB
            libdir: "lib/wasm32-wasi".into(),
            environment: vec!["USER=guest".into()],
            frame_export: "frame".into(),
        }
    }
}

impl ToolchainConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> ToolchainConfigBuilder {
        ToolchainConfigBuilder::default()
    }

    /// Load a JSON config file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| SandccError::Config(format!("{}: {e}", path.display())))
    }
}

/// Builder for ToolchainConfig
#[derive(Debug, Default)]
pub struct ToolchainConfigBuilder {
    config: ToolchainConfig,
}

impl ToolchainConfigBuilder {
    #[must_use]
    pub fn assets_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.assets_dir = dir.into();
        self
    }

    #[must_use]
    pub fn optimization(mut self, level: impl Into<String>) -> Self {
        self.config.optimization = level.into();
        self
    }

    #[must_use]
    pub fn warnings_as_errors(mut self, enabled: bool) -> Self {
        self.config.warnings_as_errors = enabled;
        self
    }

    #[must_use]
    pub fn c_standard(mut self, std: impl Into<String>) -> Self {
        self.config.c_standard = std.into();
        self
    }

    #[must_use]
    pub fn cxx_standard(mut self, std: impl Into<String>) -> Self {
        self.config.cxx_standard = std.into();
        self
    }

    #[must_use]
    pub fn stack_size(mut self, bytes: u32) -> Self {
        self.config.stack_size = bytes;
        self
    }

    #[must_use]
    pub fn stack_size_kb(self, kb: u32) -> Self {
        self.stack_size(kb * 1024)
    }

    #[must_use]
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.config
            .environment
            .push(format!("{}={}", key.as_ref(), value.as_ref()));
        self
    }

    #[must_use]
    pub fn clang_arg(mut self, arg: impl Into<String>) -> Self {
        self.config.clang_args.push(arg.into());
        self
    }

    #[must_use]
    pub fn frame_export(mut self, name: impl Into<String>) -> Self {
        self.config.frame_export = name.into();
        self
    }

    #[must_use]
    pub fn build(self) -> ToolchainConfig {
        self.config
    }
}

/// Get default assets directory from SANDCC_ASSETS env var or `./assets`
pub fn default_assets_dir() -> PathBuf {
    std::env::var("SANDCC_ASSETS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("assets"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builder_overrides_defaults() {
        let config = ToolchainConfig::builder()
            .optimization("0")
            .warnings_as_errors(false)
            .stack_size_kb(64)
            .env("HOME", "/home/guest")
            .build();

        assert_eq!(config.optimization, "0");
        assert!(!config.warnings_as_errors);
        assert_eq!(config.stack_size, 65536);
        assert_eq!(config.environment, ["USER=guest", "HOME=/home/guest"]);
        assert_eq!(config.linker_module, "lld.wasm");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"optimization": "s", "c_standard": "c99"}}"#).unwrap();

        let config = ToolchainConfig::load(file.path()).unwrap();
        assert_eq!(config.optimization, "s");
        assert_eq!(config.c_standard, "c99");
        assert_eq!(config.cxx_standard, "c++17");
        assert_eq!(config.clang_args, ToolchainConfig::default().clang_args);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            ToolchainConfig::load(file.path()),
            Err(SandccError::Config(_))
        ));
    }
}
