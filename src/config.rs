//! Process configuration, all overridable via environment or CLI flags.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bambu-batch", about = "Batch print dispatcher for a fleet of networked printers")]
pub struct Config {
    #[arg(long, env = "BAMBU_LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: String,

    #[arg(long, env = "BAMBU_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "BAMBU_UPLOADS_DIR", default_value = "uploads")]
    pub uploads_dir: PathBuf,

    #[arg(long, env = "BAMBU_STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    #[arg(long, env = "BAMBU_DB_PATH", default_value = "data/bambu-batch.sqlite3")]
    pub db_path: PathBuf,

    #[arg(long, env = "WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    #[arg(long, env = "SWAP_COOLDOWN", default_value_t = 60)]
    pub swap_cooldown_secs: u64,

    /// Default printer provisioning triple, used to seed an empty store on
    /// first start. All three must be set together or none are used.
    #[arg(long, env = "BAMBU_DEFAULT_PRINTER_HOST")]
    pub default_printer_host: Option<String>,

    #[arg(long, env = "BAMBU_DEFAULT_PRINTER_ACCESS_CODE")]
    pub default_printer_access_code: Option<String>,

    #[arg(long, env = "BAMBU_DEFAULT_PRINTER_SERIAL")]
    pub default_printer_serial: Option<String>,
}

impl Config {
    pub fn default_printer(&self) -> Option<crate::models::PrinterCreate> {
        let host_address = self.default_printer_host.clone()?;
        let access_code = self.default_printer_access_code.clone()?;
        let serial = self.default_printer_serial.clone()?;
        Some(crate::models::PrinterCreate {
            display_name: format!("Printer {serial}"),
            host_address,
            access_code,
            serial,
        })
    }
}
