use std::{fs::File, io::BufReader, path::PathBuf};

use clap_serde_derive::{
    clap::{self, Parser},
    ClapSerde,
};
use home::home_dir;
use serde::Deserialize;

const DEFAULT_CONFIG_FILE_NAME: &str = "config.yml";
const DEFAULT_STORE_DIR_NAME: &str = "store";

fn get_default_base_dir() -> PathBuf {
    let mut path = home_dir().expect("get home directory");
    path.push(".strand");
    path
}

fn get_default_config_file() -> PathBuf {
    let mut path = get_default_base_dir();
    path.push(DEFAULT_CONFIG_FILE_NAME);
    path
}

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// config file
    #[arg(short, long = "config", help = format!("config file [default: {:?} or $BASE_DIR/config.yml]", get_default_config_file()))]
    config_file: Option<PathBuf>,

    /// base directory
    #[arg(short = 'd', long = "dir", help = format!("base directory for all data [default: {:?}]", get_default_base_dir()))]
    base_dir: Option<PathBuf>,

    #[command(flatten)]
    pub node: <NodeConfig as ClapSerde>::Opt,
}

#[derive(Deserialize)]
struct SerializedConfig {
    node: Option<<NodeConfig as ClapSerde>::Opt>,
}

/// Node-level configuration, merged from the config file and command line
/// arguments (command line wins).
#[derive(ClapSerde, Debug, Clone)]
pub struct NodeConfig {
    /// directory for the embedded database
    #[arg(long = "store-dir")]
    pub store_dir: PathBuf,

    /// chain backend RPC address
    #[arg(long = "chain-rpc", default_value = "127.0.0.1:19556")]
    pub chain_rpc: String,

    /// go on chain this many blocks before an outgoing htlc expires
    #[arg(long = "outgoing-broadcast-delta", default_value = "10")]
    pub outgoing_broadcast_delta: u32,

    /// accept an incoming htlc only this many blocks before its expiry
    #[arg(long = "incoming-broadcast-delta", default_value = "10")]
    pub incoming_broadcast_delta: u32,
}

impl NodeConfig {
    pub fn parse() -> Self {
        let mut args = Args::parse();

        let base_dir = args.base_dir.clone().unwrap_or_else(get_default_base_dir);
        let config_file = args
            .config_file
            .or(args.base_dir.map(|dir| dir.join(DEFAULT_CONFIG_FILE_NAME)))
            .unwrap_or_else(get_default_config_file);

        let config_from_file = File::open(config_file).map(BufReader::new).map(|f| {
            serde_yaml::from_reader::<_, SerializedConfig>(f).expect("valid config file format")
        });

        let mut config = match config_from_file {
            Ok(SerializedConfig { node: Some(node) }) => {
                NodeConfig::from(node).merge(&mut args.node)
            }
            _ => NodeConfig::from(&mut args.node),
        };

        if config.store_dir.as_os_str().is_empty() {
            config.store_dir = base_dir.join(DEFAULT_STORE_DIR_NAME);
        }
        config
    }
}
