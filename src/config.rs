//! Command line and configuration file handling.
//!
//! Every option may come from the command line or from the `[rdma_test]`
//! table of a TOML file passed with `--config`. An explicit command-line
//! flag beats the file, which beats the built-in default.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser};
use serde::Deserialize;
use thiserror::Error;

use crate::rdma::nic::PortMtu;
use crate::rdma::qp::{ParseQpTypeError, ParseSendOpError, Qp, QpType, SendOp};
use crate::rdma::type_alias::{GidIndex, ServiceLevel};

/// Name of the TOML table holding the options.
pub const CONFIG_TABLE: &str = "rdma_test";

/// Exercise RDMA SEND/WRITE/READ between a server and a client.
#[derive(Debug, Default, Parser)]
#[command(name = "rdma_test", version, disable_version_flag = true)]
pub struct Cli {
    /// Server address. Runs as the server when omitted.
    #[arg(value_name = "SERVER_IP")]
    pub server_ip: Option<String>,

    /// Use RDMA CM instead of TCP for handshakes.
    #[arg(short = 'C', long)]
    pub use_cm: bool,

    /// RDMA device to use.
    #[arg(short = 'd', long, value_name = "NAME")]
    pub ib_dev: Option<String>,

    /// Scatter/gather entries per work request [default: 1].
    #[arg(short = 'G', long)]
    pub sg_depth: Option<u32>,

    /// Largest message sent inline [default: 0].
    #[arg(short = 'I', long)]
    pub inline_size: Option<u32>,

    /// Path MTU index from 0 (256B) to 4 (4096B) [default: 4].
    #[arg(short = 'm', long)]
    pub mtu: Option<u8>,

    /// Number of iterations [default: 1].
    #[arg(short = 'n', long)]
    pub iters: Option<u32>,

    /// Side channel port [default: 18515].
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Receive queue depth [default: 16].
    #[arg(short = 'r', long)]
    pub rx_depth: Option<u32>,

    /// Message size in bytes [default: 13].
    #[arg(short = 's', long)]
    pub size: Option<usize>,

    /// Service level [default: 0].
    #[arg(short = 'S', long)]
    pub sl: Option<ServiceLevel>,

    /// Operation: send, write or read [default: send].
    #[arg(short = 'o', long)]
    pub operation_type: Option<SendOp>,

    /// Send queue depth [default: 16].
    #[arg(short = 't', long)]
    pub tx_depth: Option<u32>,

    /// QP type: rc or ud [default: rc].
    #[arg(short = 'T', long)]
    pub qp_type: Option<QpType>,

    /// Local GID index [default: 1].
    #[arg(short = 'x', long)]
    pub gid_index: Option<GidIndex>,

    /// TOML file with option values.
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print version.
    #[arg(short = 'v', long, action = ArgAction::Version)]
    pub(crate) version: Option<bool>,
}

/// Options read from the `[rdma_test]` table of a configuration file.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub server_ip: Option<String>,
    pub use_cm: Option<bool>,
    pub ib_dev: Option<String>,
    pub sg_depth: Option<u32>,
    pub inline_size: Option<u32>,
    pub mtu: Option<u8>,
    pub iters: Option<u32>,
    pub port: Option<u16>,
    pub rx_depth: Option<u32>,
    pub size: Option<usize>,
    pub sl: Option<ServiceLevel>,
    pub operation_type: Option<String>,
    pub tx_depth: Option<u32>,
    pub qp_type: Option<String>,
    pub gid_index: Option<GidIndex>,
}

impl FileConfig {
    /// Parse the `[rdma_test]` table out of TOML text. Other tables are
    /// ignored.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut toml: toml::Table = toml::from_str(text)?;
        let table = toml.remove(CONFIG_TABLE).ok_or(ConfigError::MissingTable)?;
        Ok(table.try_into::<Self>()?)
    }

    /// Load the `[rdma_test]` table of a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

/// Configuration error type.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file cannot be read.
    #[error("cannot read configuration file {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid TOML or has unknown options.
    #[error("bad configuration file")]
    Toml(#[from] toml::de::Error),

    /// The configuration file has no `[rdma_test]` table.
    #[error("rdma_test configuration not found")]
    MissingTable,

    /// The operation named in the configuration file is unknown.
    #[error(transparent)]
    Operation(#[from] ParseSendOpError),

    /// The QP type named in the configuration file is unknown.
    #[error(transparent)]
    QpType(#[from] ParseQpTypeError),

    /// No device is given.
    #[error("no RDMA device given (use --ib-dev or `ib_dev` in the configuration file)")]
    MissingDevice,

    /// UD QPs carry SEND only.
    #[error("UD QPs don't support RDMA operations.")]
    UdRdma,

    /// The MTU index is out of `0..=4`.
    #[error("MTU index {0} is out of range 0..=4")]
    InvalidMtu(u8),

    /// A count that must be positive is zero.
    #[error("{0} must be at least 1")]
    Zero(&'static str),

    /// The service level is out of `0..=15`.
    #[error("service level {0} is out of range 0..=15")]
    InvalidSl(ServiceLevel),

    /// The message does not fit in one scatter/gather entry.
    #[error("message size {0} exceeds the limit of {max}", max = TestConfig::MAX_SIZE)]
    SizeTooLarge(usize),
}

/// Validated configuration of one test run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestConfig {
    /// Server to connect to; `None` on the server itself.
    pub server_ip: Option<String>,
    pub use_cm: bool,
    pub ib_dev: String,
    pub sg_depth: u32,
    pub inline_size: u32,
    pub mtu: PortMtu,
    pub iters: u32,
    pub port: u16,
    pub rx_depth: u32,
    pub size: usize,
    pub sl: ServiceLevel,
    pub op: SendOp,
    pub tx_depth: u32,
    pub qp_type: QpType,
    pub gid_index: GidIndex,
}

impl TestConfig {
    pub const DEFAULT_SG_DEPTH: u32 = 1;
    pub const DEFAULT_INLINE_SIZE: u32 = 0;
    pub const DEFAULT_MTU: u8 = 4;
    pub const DEFAULT_ITERS: u32 = 1;
    pub const DEFAULT_PORT: u16 = 18515;
    pub const DEFAULT_RX_DEPTH: u32 = 16;
    pub const DEFAULT_SIZE: usize = 13;

    /// Largest message size. A UD server registers the GRH in front of the
    /// message, and the whole region must fit in one SGE length.
    pub const MAX_SIZE: usize = u32::MAX as usize - Qp::GRH_SIZE;
    pub const DEFAULT_SL: ServiceLevel = 0;
    pub const DEFAULT_TX_DEPTH: u32 = 16;
    pub const DEFAULT_GID_INDEX: GidIndex = 1;

    /// Resolve the command line, loading its configuration file if any.
    pub fn resolve(cli: Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::merge(cli, file)
    }

    /// Merge command-line and file options over the defaults, then validate.
    pub fn merge(cli: Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let op = match (cli.operation_type, file.operation_type) {
            (Some(op), _) => op,
            (None, Some(op)) => op.parse()?,
            (None, None) => SendOp::default(),
        };
        let qp_type = match (cli.qp_type, file.qp_type) {
            (Some(ty), _) => ty,
            (None, Some(ty)) => ty.parse()?,
            (None, None) => QpType::default(),
        };
        let mtu = cli.mtu.or(file.mtu).unwrap_or(Self::DEFAULT_MTU);

        let config = Self {
            server_ip: cli.server_ip.or(file.server_ip),
            use_cm: cli.use_cm || file.use_cm.unwrap_or(false),
            ib_dev: cli
                .ib_dev
                .or(file.ib_dev)
                .filter(|dev| !dev.trim().is_empty())
                .ok_or(ConfigError::MissingDevice)?,
            sg_depth: cli
                .sg_depth
                .or(file.sg_depth)
                .unwrap_or(Self::DEFAULT_SG_DEPTH),
            inline_size: cli
                .inline_size
                .or(file.inline_size)
                .unwrap_or(Self::DEFAULT_INLINE_SIZE),
            mtu: PortMtu::from_index(mtu).ok_or(ConfigError::InvalidMtu(mtu))?,
            iters: cli.iters.or(file.iters).unwrap_or(Self::DEFAULT_ITERS),
            port: cli.port.or(file.port).unwrap_or(Self::DEFAULT_PORT),
            rx_depth: cli
                .rx_depth
                .or(file.rx_depth)
                .unwrap_or(Self::DEFAULT_RX_DEPTH),
            size: cli.size.or(file.size).unwrap_or(Self::DEFAULT_SIZE),
            sl: cli.sl.or(file.sl).unwrap_or(Self::DEFAULT_SL),
            op,
            tx_depth: cli
                .tx_depth
                .or(file.tx_depth)
                .unwrap_or(Self::DEFAULT_TX_DEPTH),
            qp_type,
            gid_index: cli
                .gid_index
                .or(file.gid_index)
                .unwrap_or(Self::DEFAULT_GID_INDEX),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.qp_type == QpType::Ud && self.op.is_rdma() {
            return Err(ConfigError::UdRdma);
        }
        if self.size == 0 {
            return Err(ConfigError::Zero("message size"));
        }
        if self.size > Self::MAX_SIZE {
            return Err(ConfigError::SizeTooLarge(self.size));
        }
        if self.iters == 0 {
            return Err(ConfigError::Zero("iteration count"));
        }
        if self.sg_depth == 0 {
            return Err(ConfigError::Zero("SG depth"));
        }
        if self.sl > 15 {
            return Err(ConfigError::InvalidSl(self.sl));
        }
        Ok(())
    }

    /// Whether this end runs as the server.
    #[inline]
    pub fn is_server(&self) -> bool {
        self.server_ip.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("rdma_test").chain(args.iter().copied())).unwrap()
    }

    fn resolve(args: &[&str]) -> Result<TestConfig, ConfigError> {
        TestConfig::merge(cli(args), FileConfig::default())
    }

    #[test]
    fn defaults() {
        let config = resolve(&["-d", "mlx5_0"]).unwrap();
        assert_eq!(
            config,
            TestConfig {
                server_ip: None,
                use_cm: false,
                ib_dev: "mlx5_0".to_owned(),
                sg_depth: 1,
                inline_size: 0,
                mtu: PortMtu::Mtu4096,
                iters: 1,
                port: 18515,
                rx_depth: 16,
                size: 13,
                sl: 0,
                op: SendOp::Send,
                tx_depth: 16,
                qp_type: QpType::Rc,
                gid_index: 1,
            }
        );
        assert!(config.is_server());
    }

    #[test]
    fn long_and_short_flags() {
        let config = resolve(&[
            "10.0.0.1",
            "-C",
            "--ib-dev",
            "mlx5_1",
            "-G",
            "2",
            "-I",
            "64",
            "-m",
            "2",
            "-n",
            "5",
            "--port",
            "20000",
            "-r",
            "32",
            "-s",
            "4096",
            "-S",
            "3",
            "-o",
            "write",
            "-t",
            "8",
            "-T",
            "RC",
            "--gid-index",
            "3",
        ])
        .unwrap();
        assert_eq!(config.server_ip.as_deref(), Some("10.0.0.1"));
        assert!(!config.is_server());
        assert!(config.use_cm);
        assert_eq!(config.ib_dev, "mlx5_1");
        assert_eq!((config.sg_depth, config.inline_size), (2, 64));
        assert_eq!(config.mtu, PortMtu::Mtu1024);
        assert_eq!((config.iters, config.port), (5, 20000));
        assert_eq!((config.rx_depth, config.tx_depth), (32, 8));
        assert_eq!((config.size, config.sl), (4096, 3));
        assert_eq!(config.op, SendOp::Write);
        assert_eq!(config.qp_type, QpType::Rc);
        assert_eq!(config.gid_index, 3);
    }

    #[test]
    fn bad_flag_values_fail_to_parse() {
        let parse = |args: &[&str]| {
            Cli::try_parse_from(std::iter::once("rdma_test").chain(args.iter().copied()))
        };
        assert!(parse(&["-o", "atomic"]).is_err());
        assert!(parse(&["-T", "uc"]).is_err());
        assert!(parse(&["-p", "70000"]).is_err());
        assert!(parse(&["-n", "-1"]).is_err());
    }

    #[test]
    fn version_flag() {
        let err = Cli::try_parse_from(["rdma_test", "-v"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn file_overlay_precedence() {
        let file = FileConfig::from_toml_str(
            r#"
            [other]
            peers = ["10.0.0.2"]

            [rdma_test]
            ib_dev = "mlx5_2"
            gid_index = 3
            mtu = 3
            port = 19000
            operation_type = "read"
            use_cm = true
            "#,
        )
        .unwrap();

        let config = TestConfig::merge(cli(&["-p", "18000"]), file.clone()).unwrap();
        assert_eq!(config.ib_dev, "mlx5_2");
        assert_eq!(config.gid_index, 3);
        assert_eq!(config.mtu, PortMtu::Mtu2048);
        assert_eq!(config.port, 18000);
        assert_eq!(config.op, SendOp::Read);
        assert!(config.use_cm);
        assert_eq!(config.size, TestConfig::DEFAULT_SIZE);

        let config = TestConfig::merge(cli(&["-d", "mlx5_0", "-o", "send"]), file).unwrap();
        assert_eq!(config.ib_dev, "mlx5_0");
        assert_eq!(config.op, SendOp::Send);
    }

    #[test]
    fn bad_files_are_rejected() {
        assert!(matches!(
            FileConfig::from_toml_str("[cluster]\npeers = []\n"),
            Err(ConfigError::MissingTable)
        ));
        assert!(matches!(
            FileConfig::from_toml_str("[rdma_test]\nib_device = \"mlx5_0\"\n"),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            FileConfig::from_toml_str("[rdma_test\n"),
            Err(ConfigError::Toml(_))
        ));

        let file = FileConfig::from_toml_str("[rdma_test]\nib_dev = \"x\"\nqp_type = \"xrc\"\n").unwrap();
        assert!(matches!(
            TestConfig::merge(Cli::default(), file),
            Err(ConfigError::QpType(_))
        ));
    }

    #[test]
    fn config_file_is_loaded_from_disk() {
        let path = std::env::temp_dir().join(format!("rdma_test-{}.toml", std::process::id()));
        fs::write(&path, "[rdma_test]\nib_dev = \"mlx5_3\"\niters = 7\n").unwrap();

        let path_arg = path.to_string_lossy().into_owned();
        let config = TestConfig::resolve(cli(&["-c", &path_arg])).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(config.ib_dev, "mlx5_3");
        assert_eq!(config.iters, 7);

        assert!(matches!(
            TestConfig::resolve(cli(&["-c", "/nonexistent/rdma_test.toml"])),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn validation() {
        assert!(matches!(resolve(&[]), Err(ConfigError::MissingDevice)));

        let err = resolve(&["-d", "mlx5_0", "-T", "ud", "-o", "write"]).unwrap_err();
        assert_eq!(err.to_string(), "UD QPs don't support RDMA operations.");
        assert!(matches!(
            resolve(&["-d", "mlx5_0", "-T", "ud", "-o", "read"]),
            Err(ConfigError::UdRdma)
        ));
        assert!(resolve(&["-d", "mlx5_0", "-T", "ud"]).is_ok());

        assert!(matches!(
            resolve(&["-d", "mlx5_0", "-m", "5"]),
            Err(ConfigError::InvalidMtu(5))
        ));
        assert!(matches!(
            resolve(&["-d", "mlx5_0", "-s", "0"]),
            Err(ConfigError::Zero(_))
        ));
        let too_large = (TestConfig::MAX_SIZE + 1).to_string();
        assert!(matches!(
            resolve(&["-d", "mlx5_0", "-s", &too_large]),
            Err(ConfigError::SizeTooLarge(_))
        ));
        assert!(matches!(
            resolve(&["-d", "mlx5_0", "-s", "4294967296"]),
            Err(ConfigError::SizeTooLarge(4294967296))
        ));
        let largest = TestConfig::MAX_SIZE.to_string();
        assert_eq!(
            resolve(&["-d", "mlx5_0", "-T", "ud", "-s", &largest]).unwrap().size,
            TestConfig::MAX_SIZE
        );
        assert!(matches!(
            resolve(&["-d", "mlx5_0", "-n", "0"]),
            Err(ConfigError::Zero(_))
        ));
        assert!(matches!(
            resolve(&["-d", "mlx5_0", "-S", "16"]),
            Err(ConfigError::InvalidSl(16))
        ));
        assert!(resolve(&["-d", "mlx5_0", "-S", "15", "-m", "0"]).is_ok());
    }
}
