// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use slog::{o, Drain, Level, Logger};
use vdev::bus::{read_scsi_bus_sharing, read_scsi_bus_type};
use vdev::context::ResourceData;
use vdev::{normalize_bus, Subresource, SubresourceType};
use vdev_config_toml::inventory::Inventory;

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Inspect and normalize a virtual machine's device inventory
struct Opt {
    /// TOML file describing the device inventory and bus layout
    #[clap(short, long, action)]
    config: PathBuf,

    /// Enable debugging
    #[clap(short, long, action)]
    debug: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile the storage controllers with the declared bus layout and
    /// print the resulting device list and changes
    Normalize,

    /// Locate the device backing each configured subresource
    Find {
        /// Only consider subresources of this type
        #[clap(short = 't', long = "type", action)]
        srtype: Option<String>,
    },

    /// Report the SCSI controller type and sharing mode of the declared
    /// SCSI buses
    BusState,
}

fn create_logger(opt: &Opt) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let level = if opt.debug { Level::Debug } else { Level::Info };
    let drain = slog::LevelFilter(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Logger::root(drain, o!())
}

fn load_inventory(opt: &Opt) -> anyhow::Result<Inventory> {
    let config = vdev_config_toml::parse(&opt.config).with_context(|| {
        format!("failed to parse config {}", opt.config.display())
    })?;
    Inventory::try_from(&config).context("invalid device inventory")
}

fn normalize(log: &Logger, inv: Inventory) -> anyhow::Result<()> {
    let (devices, changes) = normalize_bus(log, inv.devices, &inv.bus)
        .context("failed to normalize bus")?;
    slog::info!(log, "normalized bus"; "changes" => changes.len());

    let out = json!({ "devices": devices, "changes": changes });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn find(
    log: &Logger,
    inv: Inventory,
    srtype: Option<SubresourceType>,
) -> anyhow::Result<()> {
    let machine = ResourceData::default();
    let mut results = Vec::new();

    for state in inv.subresources {
        if srtype.is_some_and(|t| t != state.srtype) {
            continue;
        }
        let mut sr = Subresource::new(
            log,
            state.srtype,
            &machine,
            state.data,
            state.olddata,
            state.index,
        );

        let device = match sr.find_virtual_device(&inv.devices) {
            Ok(device) => device,
            Err(e) => {
                slog::warn!(log, "device lookup failed";
                    "subresource" => sr.addr(), "error" => %e);
                results.push(json!({
                    "subresource": sr.addr(),
                    "error": e.to_string(),
                }));
                continue;
            }
        };

        // Refresh the recorded identity from the device's current position.
        if let Some(ctlr) =
            device.controller_key.and_then(|k| inv.devices.find_by_key(k))
        {
            sr.save_dev_ids(device, ctlr)
                .with_context(|| format!("failed to address {}", sr.addr()))?;
        }

        results.push(json!({
            "subresource": sr.addr(),
            "device": device,
            "data": sr.data(),
            "hash": format!("{:016x}", sr.hash()),
        }));
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn bus_state(inv: &Inventory) -> anyhow::Result<()> {
    let count = inv.bus.scsi_count;
    let out = json!({
        "scsi_controller_count": count,
        "scsi_type": read_scsi_bus_type(&inv.devices, count).to_string(),
        "scsi_bus_sharing":
            read_scsi_bus_sharing(&inv.devices, count).to_string(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let log = create_logger(&opt);
    let inv = load_inventory(&opt)?;

    match opt.cmd {
        Command::Normalize => normalize(&log, inv)?,
        Command::Find { srtype } => {
            let srtype = srtype
                .map(|t| {
                    t.parse::<SubresourceType>()
                        .with_context(|| format!("unknown subresource {t:?}"))
                })
                .transpose()?;
            find(&log, inv, srtype)?
        }
        Command::BusState => bus_state(&inv)?,
    }

    Ok(())
}
