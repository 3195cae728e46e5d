use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "flowmark")]
#[command(version, about = "Classifies NFQUEUE'd flows against application-layer rules")]
pub struct Cli {
    /// Number of the NFQUEUE to listen to for packets to classify
    #[arg(short, long, default_value_t = 0)]
    pub queue: u16,

    /// Hex mask selecting the packet-mark bits that carry the verdict
    #[arg(long = "mark_mask", value_parser = parse_mark_mask, default_value = "0xffff")]
    pub mark_mask: u32,

    /// File containing the classification rules, one
    /// 'mark=<mark> proto=<proto> [url=<re>] [method=<m>]' per line
    /// (method_re and url_maxsize are also accepted)
    #[arg(short, long)]
    pub rules: PathBuf,
}

fn parse_mark_mask(s: &str) -> Result<u32, String> {
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(hex, 16).map_err(|e| format!("invalid hex mask '{}': {}", s, e))
}
