//! ArrayIO CLI - operator surface and monitor loop
//!
//! Every command recovers the engine from the metadata database, applies one
//! operation, flushes the resulting commits and prints the outcome as JSON.
//! `monitor` keeps the engine running and ticks it on an interval.

use anyhow::{Context, Result, anyhow, bail};
use arrayio_common::{
    BackgroundService, CheckpointKind, Config, DeathReason, DriveType, FruId, FruLocation,
    FruPersistentFlags, FruRecord, LuId, LuPowerPolicy, ObjectType, RaidGroupId,
    RaidGroupPowerPolicy, RaidType, Requestor, Scope, SpareKind,
};
use arrayio_engine::{
    ArrayEngine, Discovery, LuSpec, ObjectFilter, ObjectTypeMask, RaidGroupSpec, StateMask,
    SystemClock,
};
use arrayio_meta_store::MetaStore;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "arrayio-cli")]
#[command(about = "ArrayIO operator CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/arrayio/arrayio.toml")]
    config: String,

    /// Metadata database path (overrides persist.path)
    #[arg(long, env = "ARRAYIO_DB")]
    db: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive operations
    Fru {
        #[command(subcommand)]
        action: FruCommands,
    },
    /// RAID group operations
    Rg {
        #[command(subcommand)]
        action: RgCommands,
    },
    /// Logical unit operations
    Lu {
        #[command(subcommand)]
        action: LuCommands,
    },
    /// Background service gates and throughput scale
    Bgs {
        #[command(subcommand)]
        action: BgsCommands,
    },
    /// Spare selection and swaps
    Spare {
        #[command(subcommand)]
        action: SpareCommands,
    },
    /// Checkpoint queries
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointCommands,
    },
    /// Array-wide power-save settings
    Power {
        #[command(subcommand)]
        action: PowerCommands,
    },
    /// List objects by type and RAID group scope
    List {
        /// fru, rg or lu
        #[arg(long = "type")]
        object_type: Option<String>,
        /// Only objects of this RAID group
        #[arg(long)]
        rg: Option<u32>,
    },
    /// Run the engine, ticking on an interval until interrupted
    Monitor {
        /// Tick interval in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
        /// Start with every background service held
        #[arg(long)]
        paused: bool,
        /// Print lifecycle events as they happen
        #[arg(long)]
        events: bool,
    },
}

#[derive(Subcommand, Debug)]
enum FruCommands {
    /// Show drive details
    Show { id: u32 },
    /// Register a present drive
    Add {
        #[arg(long, default_value = "0")]
        bus: u8,
        #[arg(long)]
        enclosure: u8,
        #[arg(long)]
        slot: u16,
        /// Capacity in blocks
        #[arg(long)]
        capacity: u64,
        /// sas, nl-sas or flash
        #[arg(long, default_value = "sas")]
        drive_type: String,
        #[arg(long, default_value = "520")]
        block_size: u32,
    },
    /// Mark (or unmark) a drive as a hot spare
    HotSpare {
        id: u32,
        #[arg(long)]
        off: bool,
    },
    /// Flag a drive for proactive sparing
    EndOfLife { id: u32 },
    /// Simulate a drive pull
    Remove { id: u32 },
    /// Simulate a drive fault
    Fault {
        id: u32,
        /// hardware-fault, link-fault, end-of-life or unknown
        #[arg(long, default_value = "hardware-fault")]
        reason: String,
    },
    /// Simulate reinsertion; the drive powers up and becomes Ready
    Insert { id: u32 },
}

#[derive(Subcommand, Debug)]
enum RgCommands {
    /// Show RAID group details and health
    Show { id: u32 },
    /// Bind a RAID group over the given drives (position order)
    Bind {
        /// raid0, raid1, raid10, raid3, raid5 or raid6
        #[arg(long)]
        raid_type: String,
        #[arg(long, value_delimiter = ',')]
        members: Vec<u32>,
        /// Blocks used on each member
        #[arg(long)]
        blocks: u64,
        #[arg(long, default_value = "0")]
        offset: u64,
        /// Zero every member before use
        #[arg(long)]
        zero: bool,
    },
    /// Destroy a RAID group with no LUs bound
    Destroy { id: u32 },
    /// Grow every member extent to a new ending address
    Expand {
        id: u32,
        #[arg(long)]
        ending_address: u64,
    },
    /// Set the RAID group power-save policy
    Power {
        id: u32,
        #[arg(long)]
        enabled: bool,
        #[arg(long, default_value = "1800")]
        idle_secs: u64,
    },
}

#[derive(Subcommand, Debug)]
enum LuCommands {
    /// Show LU details
    Show { id: u32 },
    /// Bind an LU after the RAID group's existing LUs
    Bind {
        #[arg(long)]
        rg: u32,
        /// Capacity in blocks
        #[arg(long)]
        capacity: u64,
        #[arg(long)]
        verify: bool,
    },
    /// Unbind an LU
    Unbind { id: u32 },
    /// Start a background verify
    Verify { id: u32 },
    /// Set the LU power-save policy
    Power {
        id: u32,
        #[arg(long)]
        enabled: bool,
        /// Overrides the RAID group idle time
        #[arg(long)]
        delay_secs: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum BgsCommands {
    /// Enable a service at a scope for a requestor
    Enable {
        /// system, rg:N, lu:N or fru:N
        #[arg(long, default_value = "system")]
        scope: String,
        #[arg(long)]
        service: String,
        #[arg(long, default_value = "user")]
        requestor: String,
    },
    /// Disable a service at a scope for a requestor
    Disable {
        #[arg(long, default_value = "system")]
        scope: String,
        #[arg(long)]
        service: String,
        #[arg(long, default_value = "user")]
        requestor: String,
    },
    /// Show which requestors hold each service at a scope
    Show {
        #[arg(long, default_value = "system")]
        scope: String,
    },
    /// Set the global throughput scale (0-100)
    Scale { percent: u8 },
}

#[derive(Subcommand, Debug)]
enum SpareCommands {
    /// Classify a drive's sparing role
    Classify { id: u32 },
    /// Show the spare that would replace a drive
    Select { id: u32 },
    /// Swap a spare in for a drive; picks one when --spare is omitted
    Swap {
        #[arg(long)]
        target: u32,
        #[arg(long)]
        spare: Option<u32>,
        /// Copy from the live drive instead of rebuilding
        #[arg(long)]
        proactive: bool,
    },
    /// Detach the source of a finished proactive copy
    SwapOut {
        #[arg(long)]
        rg: u32,
        #[arg(long)]
        position: usize,
    },
}

#[derive(Subcommand, Debug)]
enum CheckpointCommands {
    /// Show one checkpoint
    Show {
        #[arg(long)]
        fru: u32,
        #[arg(long, default_value = "0")]
        partition: u8,
        /// rebuild, verify, zero or expansion
        #[arg(long)]
        kind: String,
    },
    /// List every operation with work left
    Pending,
}

#[derive(Subcommand, Debug)]
enum PowerCommands {
    /// Enable array-wide power saving
    On,
    /// Disable array-wide power saving
    Off,
    /// Set the forced wake-up period (0 disables)
    Wakeup { secs: u64 },
    /// Show the persisted array-wide settings
    Show,
}

#[derive(Serialize)]
struct GateView {
    service: &'static str,
    disabled_by: Vec<&'static str>,
    effective: bool,
}

fn load_config(args: &Args) -> Result<Config> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .add_source(
            config::Environment::with_prefix("ARRAYIO")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;
    let mut config: Config = settings.try_deserialize()?;
    if let Some(db) = &args.db {
        config.persist.path.clone_from(db);
    }
    Ok(config)
}

fn parse_raid_type(s: &str) -> Result<RaidType> {
    Ok(match s {
        "raid0" => RaidType::Raid0,
        "raid1" => RaidType::Raid1,
        "raid10" => RaidType::Raid10,
        "raid3" => RaidType::Raid3,
        "raid5" => RaidType::Raid5,
        "raid6" => RaidType::Raid6,
        _ => bail!("Unknown raid type '{s}'"),
    })
}

fn parse_drive_type(s: &str) -> Result<DriveType> {
    Ok(match s {
        "sas" => DriveType::Sas,
        "nl-sas" => DriveType::NlSas,
        "flash" => DriveType::Flash,
        _ => bail!("Unknown drive type '{s}'"),
    })
}

fn parse_death_reason(s: &str) -> Result<DeathReason> {
    Ok(match s {
        "hardware-fault" => DeathReason::HardwareFault,
        "link-fault" => DeathReason::LinkFault,
        "end-of-life" => DeathReason::EndOfLife,
        "unknown" => DeathReason::Unknown,
        _ => bail!("Unknown fault reason '{s}'"),
    })
}

fn parse_kind(s: &str) -> Result<CheckpointKind> {
    Ok(match s {
        "rebuild" => CheckpointKind::Rebuild,
        "verify" => CheckpointKind::Verify,
        "zero" => CheckpointKind::Zero,
        "expansion" => CheckpointKind::Expansion,
        _ => bail!("Unknown checkpoint kind '{s}'"),
    })
}

fn parse_object_type(s: &str) -> Result<ObjectType> {
    Ok(match s {
        "fru" => ObjectType::Fru,
        "rg" => ObjectType::RaidGroup,
        "lu" => ObjectType::Lu,
        _ => bail!("Unknown object type '{s}'"),
    })
}

/// `system`, `rg:N`, `lu:N` or `fru:N`
fn parse_scope(s: &str) -> Result<Scope> {
    if s == "system" {
        return Ok(Scope::System);
    }
    let (kind, id) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid scope '{s}', expected system, rg:N, lu:N or fru:N"))?;
    let id: u32 = id.parse().map_err(|_| anyhow!("Invalid id in scope '{s}'"))?;
    Ok(match kind {
        "rg" => Scope::RaidGroup(RaidGroupId::new(id)),
        "lu" => Scope::Lu(LuId::new(id)),
        "fru" => Scope::Fru(FruId::new(id)),
        _ => bail!("Unknown scope kind '{kind}'"),
    })
}

fn parse_service(s: &str) -> Result<BackgroundService> {
    BackgroundService::from_name(s).ok_or_else(|| anyhow!("Unknown service '{s}'"))
}

fn parse_requestor(s: &str) -> Result<Requestor> {
    Requestor::from_name(s).ok_or_else(|| anyhow!("Unknown requestor '{s}'"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_engine(config: Config) -> Result<ArrayEngine> {
    let path = config.persist.path.clone();
    let backend = Arc::new(
        MetaStore::open(&path)
            .with_context(|| format!("Failed to open metadata database {}", path.display()))?,
    );
    let engine = ArrayEngine::recover(
        config,
        backend,
        Arc::new(SystemClock::new()),
        &Discovery::FromLastKnown,
    )?;
    Ok(engine)
}

fn run_fru(engine: &ArrayEngine, action: FruCommands) -> Result<()> {
    match action {
        FruCommands::Show { id } => print_json(&engine.fru(FruId::new(id))?)?,
        FruCommands::Add {
            bus,
            enclosure,
            slot,
            capacity,
            drive_type,
            block_size,
        } => {
            let record = FruRecord {
                location: FruLocation::new(bus, enclosure, slot),
                capacity,
                drive_type: parse_drive_type(&drive_type)?,
                block_size,
                flags: FruPersistentFlags::default(),
                partitions: Vec::new(),
                spare_info: None,
                death_reason: None,
            };
            let id = engine.add_fru(record)?;
            print_json(&engine.fru(id)?)?;
        }
        FruCommands::HotSpare { id, off } => engine.set_hot_spare(FruId::new(id), !off)?,
        FruCommands::EndOfLife { id } => engine.mark_end_of_life(FruId::new(id))?,
        FruCommands::Remove { id } => engine.fru_removed(FruId::new(id))?,
        FruCommands::Fault { id, reason } => {
            engine.fru_faulted(FruId::new(id), parse_death_reason(&reason)?)?;
        }
        FruCommands::Insert { id } => {
            let id = FruId::new(id);
            engine.fru_inserted(id)?;
            engine.fru_ready(id)?;
            print_json(&engine.fru(id)?)?;
        }
    }
    Ok(())
}

fn run_rg(engine: &ArrayEngine, action: RgCommands) -> Result<()> {
    match action {
        RgCommands::Show { id } => {
            let id = RaidGroupId::new(id);
            print_json(&serde_json::json!({
                "raid_group": engine.raid_group(id)?,
                "state": engine.raid_group_state(id)?,
            }))?;
        }
        RgCommands::Bind {
            raid_type,
            members,
            blocks,
            offset,
            zero,
        } => {
            let spec = RaidGroupSpec {
                raid_type: parse_raid_type(&raid_type)?,
                members: members.into_iter().map(FruId::new).collect(),
                address_offset: offset,
                blocks_per_member: blocks,
                power_policy: RaidGroupPowerPolicy::default(),
                zero,
            };
            let id = engine.bind_raid_group(&spec)?;
            print_json(&engine.raid_group(id)?)?;
        }
        RgCommands::Destroy { id } => engine.destroy_raid_group(RaidGroupId::new(id))?,
        RgCommands::Expand { id, ending_address } => {
            engine.start_expansion(RaidGroupId::new(id), ending_address)?;
        }
        RgCommands::Power {
            id,
            enabled,
            idle_secs,
        } => engine.set_raid_group_power_policy(
            RaidGroupId::new(id),
            RaidGroupPowerPolicy { enabled, idle_secs },
        )?,
    }
    Ok(())
}

fn run_lu(engine: &ArrayEngine, action: LuCommands) -> Result<()> {
    match action {
        LuCommands::Show { id } => print_json(&engine.lu(LuId::new(id))?)?,
        LuCommands::Bind {
            rg,
            capacity,
            verify,
        } => {
            let mut spec = LuSpec::new(RaidGroupId::new(rg), capacity);
            spec.needs_background_verify = verify;
            let id = engine.bind_lu(&spec)?;
            print_json(&engine.lu(id)?)?;
        }
        LuCommands::Unbind { id } => engine.unbind_lu(LuId::new(id))?,
        LuCommands::Verify { id } => engine.request_verify(LuId::new(id))?,
        LuCommands::Power {
            id,
            enabled,
            delay_secs,
        } => {
            let id = LuId::new(id);
            let current = engine.lu(id)?.record.power_policy;
            engine.set_lu_power_policy(
                id,
                LuPowerPolicy {
                    enabled,
                    hibernate_delay_secs: delay_secs,
                    ..current
                },
            )?;
        }
    }
    Ok(())
}

fn run_bgs(engine: &ArrayEngine, action: BgsCommands) -> Result<()> {
    match action {
        BgsCommands::Enable {
            scope,
            service,
            requestor,
        } => engine.enable_service(
            parse_scope(&scope)?,
            parse_service(&service)?,
            parse_requestor(&requestor)?,
        )?,
        BgsCommands::Disable {
            scope,
            service,
            requestor,
        } => engine.disable_service(
            parse_scope(&scope)?,
            parse_service(&service)?,
            parse_requestor(&requestor)?,
        )?,
        BgsCommands::Show { scope } => {
            let scope = parse_scope(&scope)?;
            let arbiter = engine.arbiter();
            let gates: Vec<GateView> = BackgroundService::ALL
                .into_iter()
                .map(|service| GateView {
                    service: service.name(),
                    disabled_by: arbiter
                        .disabled_by(scope, service)
                        .into_iter()
                        .map(Requestor::name)
                        .collect(),
                    effective: arbiter.is_enabled(scope, service),
                })
                .collect();
            print_json(&serde_json::json!({
                "scope": scope,
                "scale_percent": arbiter.scale(),
                "services": gates,
            }))?;
        }
        BgsCommands::Scale { percent } => engine.set_scale(percent)?,
    }
    Ok(())
}

fn run_spare(engine: &ArrayEngine, action: SpareCommands) -> Result<()> {
    match action {
        SpareCommands::Classify { id } => print_json(&engine.classify(FruId::new(id))?)?,
        SpareCommands::Select { id } => print_json(&engine.select_spare(FruId::new(id))?)?,
        SpareCommands::Swap {
            target,
            spare,
            proactive,
        } => {
            let kind = if proactive {
                SpareKind::Proactive
            } else {
                SpareKind::HotSpare
            };
            let target = FruId::new(target);
            let spare = match spare {
                Some(spare) => {
                    let spare = FruId::new(spare);
                    engine.swap_in(spare, target, kind)?;
                    spare
                }
                None => engine.spare_for(target, kind)?,
            };
            print_json(&engine.fru(spare)?)?;
        }
        SpareCommands::SwapOut { rg, position } => {
            let source = engine.swap_out(RaidGroupId::new(rg), position)?;
            print_json(&engine.fru(source)?)?;
        }
    }
    Ok(())
}

fn run_checkpoint(engine: &ArrayEngine, action: CheckpointCommands) -> Result<()> {
    match action {
        CheckpointCommands::Show {
            fru,
            partition,
            kind,
        } => print_json(&engine.checkpoint(parse_kind(&kind)?, FruId::new(fru), partition)?)?,
        CheckpointCommands::Pending => print_json(&engine.pending_work())?,
    }
    Ok(())
}

fn run_power(engine: &ArrayEngine, action: PowerCommands) -> Result<()> {
    match action {
        PowerCommands::On => engine.set_system_power_save(true),
        PowerCommands::Off => engine.set_system_power_save(false),
        PowerCommands::Wakeup { secs } => engine.set_wakeup_interval(secs),
        PowerCommands::Show => print_json(&engine.system())?,
    }
    Ok(())
}

async fn monitor(engine: ArrayEngine, interval_ms: u64, paused: bool, events: bool) -> Result<()> {
    if paused {
        engine.disable_all_services();
        info!("Background services held");
    }
    let mut rx = engine.subscribe(
        if events {
            ObjectTypeMask::ALL
        } else {
            ObjectTypeMask::of(&[])
        },
        StateMask::ALL,
    );
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    info!("Monitoring, tick every {}ms", interval_ms);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match engine.tick() {
                    Ok(report) if report.steps > 0 || report.swaps > 0 => {
                        info!(
                            "tick: {} steps ({} blocks, {} completed), {} swaps, {} flushed",
                            report.steps, report.blocks, report.completed, report.swaps,
                            report.flushed
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Tick failed: {}", e),
                }
            }
            Some(event) = rx.recv() => {
                println!("{}", serde_json::to_string(&event)?);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    let flushed = engine.flush()?;
    info!("Flushed {} records on shutdown", flushed);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    let engine = open_engine(config)?;

    match args.command {
        Commands::Fru { action } => run_fru(&engine, action)?,
        Commands::Rg { action } => run_rg(&engine, action)?,
        Commands::Lu { action } => run_lu(&engine, action)?,
        Commands::Bgs { action } => run_bgs(&engine, action)?,
        Commands::Spare { action } => run_spare(&engine, action)?,
        Commands::Checkpoint { action } => run_checkpoint(&engine, action)?,
        Commands::Power { action } => run_power(&engine, action)?,
        Commands::List { object_type, rg } => {
            let filter = ObjectFilter {
                object_type: object_type.as_deref().map(parse_object_type).transpose()?,
                raid_group: rg.map(RaidGroupId::new),
            };
            print_json(&engine.list(&filter))?;
        }
        Commands::Monitor {
            interval_ms,
            paused,
            events,
        } => return monitor(engine, interval_ms, paused, events).await,
    }

    let flushed = engine.flush()?;
    if flushed > 0 {
        info!("Committed {} records", flushed);
    }
    Ok(())
}
