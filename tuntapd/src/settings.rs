//! Configuration file support. Values from the file are used for every flag which is not set on
//! the command line.

use std::path::{Path, PathBuf};

use clap::Args;
use config::{ConfigError, File, FileFormat};
use serde::Deserialize;
use tuntap::PollConfig;

use crate::logging::LoggingFormat;

/// Default name of tun interface
#[cfg(not(target_os = "macos"))]
pub const TUN_NAME: &str = "tun0";
/// Default name of tun interface
#[cfg(target_os = "macos")]
pub const TUN_NAME: &str = "utun3";

#[derive(Debug, Default, Args)]
pub struct DeviceArguments {
    /// Name to use for the TUN interface.
    ///
    /// The name set here must be valid for the current platform, e.g. on OSX, the name must start
    /// with `utun` and be followed by digits. An empty name lets the system pick one.
    #[arg(long = "tun-name", global = true)]
    pub tun_name: Option<String>,

    /// Size of the buffer used to read a single packet while polling the device.
    #[arg(long = "read-buffer-size", global = true)]
    pub read_buffer_size: Option<usize>,

    /// Amount of packets which can be queued for delivery before reading from the device is
    /// suspended.
    #[arg(long = "channel-capacity", global = true)]
    pub channel_capacity: Option<usize>,
}

/// Contents of the config file. All keys are optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub tun_name: Option<String>,
    pub read_buffer_size: Option<usize>,
    pub channel_capacity: Option<usize>,
    pub logging_format: Option<LoggingFormat>,
}

/// Resolved device settings.
#[derive(Debug)]
pub struct DeviceSettings {
    pub tun_name: String,
    pub poll_config: PollConfig,
}

/// Location of the config file if none is given explicitly.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tuntapd").join("tuntapd.toml"))
}

/// Load the config file. An explicitly provided file must exist, the default file is optional.
pub fn load_config_file(path: Option<&Path>) -> Result<FileConfig, ConfigError> {
    let (path, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => match default_config_path() {
            Some(path) => (path, false),
            None => return Ok(FileConfig::default()),
        },
    };

    config::Config::builder()
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(required),
        )
        .build()?
        .try_deserialize()
}

/// Merge the command line arguments with the config file. Command line values take precedence.
pub fn merge_config(args: DeviceArguments, file: FileConfig) -> DeviceSettings {
    let defaults = PollConfig::default();

    DeviceSettings {
        tun_name: args
            .tun_name
            .or(file.tun_name)
            .unwrap_or_else(|| TUN_NAME.to_string()),
        poll_config: PollConfig {
            read_buffer_size: args
                .read_buffer_size
                .or(file.read_buffer_size)
                .unwrap_or(defaults.read_buffer_size),
            channel_capacity: args
                .channel_capacity
                .or(file.channel_capacity)
                .unwrap_or(defaults.channel_capacity),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tuntap::PollConfig;

    use super::{load_config_file, merge_config, DeviceArguments, FileConfig, TUN_NAME};
    use crate::logging::LoggingFormat;

    fn write_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "tuntapd-{}-{name}.toml",
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn defaults_without_config() {
        let settings = merge_config(DeviceArguments::default(), FileConfig::default());
        assert_eq!(settings.tun_name, TUN_NAME);
        assert_eq!(settings.poll_config, PollConfig::default());
    }

    #[test]
    fn arguments_override_file() {
        let args = DeviceArguments {
            tun_name: Some("tun9".to_string()),
            read_buffer_size: None,
            channel_capacity: Some(8),
        };
        let file = FileConfig {
            tun_name: Some("tun3".to_string()),
            read_buffer_size: Some(1500),
            channel_capacity: Some(2),
            logging_format: None,
        };

        let settings = merge_config(args, file);
        assert_eq!(settings.tun_name, "tun9");
        assert_eq!(settings.poll_config.read_buffer_size, 1500);
        assert_eq!(settings.poll_config.channel_capacity, 8);
    }

    #[test]
    fn load_toml_file() {
        let path = write_config(
            "load",
            "tun_name = \"probe0\"\nchannel_capacity = 4\nlogging_format = \"logfmt\"\n",
        );

        let config = load_config_file(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.tun_name.as_deref(), Some("probe0"));
        assert_eq!(config.channel_capacity, Some(4));
        assert_eq!(config.read_buffer_size, None);
        assert_eq!(config.logging_format, Some(LoggingFormat::Logfmt));
    }

    #[test]
    fn explicit_file_must_exist() {
        let path = std::env::temp_dir().join("tuntapd-this-file-does-not-exist.toml");
        assert!(load_config_file(Some(&path)).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let path = write_config("invalid", "channel_capacity = \"many\"\n");

        let res = load_config_file(Some(&path));
        std::fs::remove_file(&path).unwrap();

        assert!(res.is_err());
    }
}
