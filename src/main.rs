use clap::Parser;
use color_eyre::eyre::{ensure, WrapErr};
use color_eyre::Result;
use log::info;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;

use nbdserve::{Export, Registry, Server};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long)]
    port: u16,

    /// alternating FILE NAME values, each pair exporting FILE under NAME
    #[arg(short, long = "device", value_names = ["FILE", "NAME"], num_args = 2.., required = true)]
    devices: Vec<String>,
}

/// Open `path` for export under `name`, falling back to a read-only export
/// when the file is not writable.
fn open_export(path: &str, name: &str) -> Result<Export<File>> {
    match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => Export::new(name, file, false),
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            let file = File::open(path).wrap_err_with(|| format!("opening {path}"))?;
            Export::new(name, file, true)
        }
        Err(err) => Err(err).wrap_err_with(|| format!("opening {path}")),
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();
    ensure!(
        args.devices.len() % 2 == 0,
        "devices must come in FILE NAME pairs ({} values given)",
        args.devices.len()
    );

    let mut exports = Vec::with_capacity(args.devices.len() / 2);
    for pair in args.devices.chunks(2) {
        let export = open_export(&pair[0], &pair[1])?;
        info!(target: "nbd", "exporting {} as {:?} ({} bytes{})",
              pair[0],
              export.name(),
              export.size(),
              if export.read_only() { ", read-only" } else { "" });
        exports.push(export);
    }
    let registry = Registry::from_exports(exports)?;

    Server::new(registry).start(args.port)
}
