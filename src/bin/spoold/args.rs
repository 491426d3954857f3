use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub(crate) struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub(crate) listen: IpAddr,
    /// (TCP) port to listen on.
    #[arg(short, long, default_value_t = 9199)]
    pub(crate) port: u16,
    /// YAML file with worker, retry and printer settings.
    #[arg(short, long)]
    pub(crate) config: Option<PathBuf>,
    /// Sets the maximum allowed size of a single label payload.
    #[arg(short = 'z', long, default_value_t = 65535)]
    pub(crate) max_unit_size: u32,
    /// Sets the maximum number of labels in a single job.
    #[arg(short = 'u', long, default_value_t = 10000)]
    pub(crate) max_units: u32,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub(crate) debug: bool,
}
