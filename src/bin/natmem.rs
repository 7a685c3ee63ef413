//! natmem CLI tool
//!
//! Shows what the host offers and how a memory configuration would be laid
//! out in the arena.

use std::process;
use std::sync::Once;

use natmem::{
    plan_layout, AddressSpace, CapacityBound, MaxMem, MemoryConfig, NaturalMemory, RegionName,
    RtgBus,
};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

const MIB: usize = 1024 * 1024;

static INIT: Once = Once::new();

/// Install a compact subscriber filtered by `RUST_LOG` (default `warn`).
fn setup_logger() {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt::Subscriber::builder()
            .compact()
            .with_file(false)
            .with_target(true)
            .with_thread_names(false)
            .with_env_filter(env_filter)
            .finish()
            .init();
    });
}

fn main() {
    setup_logger();
    let args: Vec<String> = std::env::args().collect();
    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    // argv may be empty when spawned without one
    let program = args.first().map_or("natmem", String::as_str);

    let Some(command) = args.get(1) else {
        print_usage(program);
        return Ok(());
    };

    match command.as_str() {
        "info" => cmd_info()?,
        "plan" => cmd_plan(&args[2..])?,
        "help" | "--help" | "-h" => print_usage(program),
        "version" | "--version" | "-V" => print_version(),
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage(program);
            process::exit(1);
        }
    }

    Ok(())
}

fn print_usage(program: &str) {
    println!(
        r#"natmem - guest memory arena planner

USAGE:
    {} <COMMAND> [OPTIONS]

COMMANDS:
    info    Show host memory and the derived arena bound
    plan    Lay out a memory configuration
    help    Show this help message
    version Show version information

PLAN OPTIONS:
    --bits <24|32>      CPU address bus width (default: 24)
    --chip <MB>         Chip RAM (default: 0.5)
    --slow <KB>         Slow RAM
    --fast <MB>         Zorro II fast RAM
    --z3 <MB>           Zorro III fast RAM
    --z3-2 <MB>         Second Zorro III fast RAM tier
    --z3-chip <MB>      Zorro III chip-class RAM
    --rtg <MB>          Graphics card RAM
    --rtg-bus <z2|z3>   Graphics card bus (default: z3)
    --max-mem <MB>      Arena limit (default: host memory)
    --reserve           Reserve the arena and attach the configured RAM

EXAMPLES:
    {} plan --chip 2 --fast 8
    {} plan --bits 32 --z3 1024 --z3-2 256 --max-mem 512 --reserve
"#,
        program, program, program
    );
}

fn print_version() {
    println!("natmem {}", env!("CARGO_PKG_VERSION"));
    println!("Backend: {}", natmem::backend_name());
    #[cfg(target_pointer_width = "64")]
    println!("Pointer width: 64");
    #[cfg(not(target_pointer_width = "64"))]
    println!("Pointer width: 32");
}

fn cmd_info() -> Result<(), Box<dyn std::error::Error>> {
    let capacity = natmem::probe();
    let bound = CapacityBound::new(capacity, MaxMem::Host);

    println!("Host Memory");
    println!("===========");
    println!("Backend: {}", natmem::backend_name());
    println!("Page size: {} bytes", capacity.page_size);
    println!("Physical memory: {} MB", capacity.total_physical >> 20);
    println!("Arena ceiling: {} MB", bound.ceiling() >> 20);
    println!("Arena bound: {} MB", bound.bytes() >> 20);
    println!("Largest Zorro III RAM: {} MB", bound.max_z3_fast() >> 20);

    Ok(())
}

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, Box<dyn std::error::Error>> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires a value", flag).into())
}

fn cmd_plan(args: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let mut builder = MemoryConfig::builder();
    let mut rtg_mb = 0usize;
    let mut rtg_bus = RtgBus::Z3;
    let mut reserve = false;

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--bits" => {
                builder = match next_value(args, &mut i, flag)? {
                    "24" => builder.address_space(AddressSpace::Bits24),
                    "32" => builder.address_space(AddressSpace::Bits32),
                    other => return Err(format!("Unsupported bus width: {}", other).into()),
                };
            }
            "--chip" => {
                let mb: f64 = next_value(args, &mut i, flag)?.parse()?;
                builder = builder.chip((mb * MIB as f64) as usize);
            }
            "--slow" => {
                let kb: usize = next_value(args, &mut i, flag)?.parse()?;
                builder = builder.slow(kb * 1024);
            }
            "--fast" => builder = builder.fast_mb(next_value(args, &mut i, flag)?.parse()?),
            "--z3" => builder = builder.z3_fast_mb(next_value(args, &mut i, flag)?.parse()?),
            "--z3-2" => {
                let mb: usize = next_value(args, &mut i, flag)?.parse()?;
                builder = builder.z3_fast2(mb * MIB);
            }
            "--z3-chip" => {
                let mb: usize = next_value(args, &mut i, flag)?.parse()?;
                builder = builder.z3_chip(mb * MIB);
            }
            "--rtg" => rtg_mb = next_value(args, &mut i, flag)?.parse()?,
            "--rtg-bus" => {
                rtg_bus = match next_value(args, &mut i, flag)? {
                    "z2" => RtgBus::Z2,
                    "z3" => RtgBus::Z3,
                    other => return Err(format!("Unknown graphics bus: {}", other).into()),
                };
            }
            "--max-mem" => {
                builder = builder.max_mem(MaxMem::Limit(next_value(args, &mut i, flag)?.parse()?));
            }
            "--reserve" => reserve = true,
            _ => return Err(format!("Unknown argument: {}", args[i]).into()),
        }
        i += 1;
    }

    let config = builder.rtg(rtg_mb * MIB, rtg_bus).build()?;
    let bound = CapacityBound::new(natmem::probe(), config.max_mem);
    let plan = plan_layout(&config, &bound)?;

    println!("Layout ({} MB bound)", bound.bytes() >> 20);
    println!("======");
    println!("{}", plan);
    for record in plan.shrink_history() {
        println!(
            "  shrink {:<16} freed {:>5} MB, total {} MB",
            record.step.to_string(),
            record.freed >> 20,
            record.total_after >> 20
        );
    }

    if reserve {
        cmd_reserve(&config)?;
    }

    Ok(())
}

fn cmd_reserve(config: &MemoryConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut mem = NaturalMemory::new();
    let remap = mem.plan_and_reserve(config)?;
    println!();
    println!(
        "Reserved {} MB at {:#x} (generation {})",
        remap.total_size >> 20,
        remap.base,
        remap.generation
    );
    if let Some((start, len)) = remap.rtg {
        println!("Graphics pool: {} KB at {:#x}", len >> 10, start);
    }

    let effective = mem.config().clone();
    let wanted = [
        (RegionName::Chip, effective.chip_size),
        (RegionName::Bogo, effective.slow_size),
        (RegionName::Fast, effective.fast_size),
        (RegionName::Z2Gfx, effective.z2_rtg_size()),
        (RegionName::Z3, effective.z3_fast_size),
        (RegionName::Z3Second, effective.z3_fast2_size),
        (RegionName::Z3Chip, effective.z3_chip_size),
        (RegionName::Z3Gfx, effective.z3_rtg_size()),
    ];
    for (name, size) in wanted.into_iter().filter(|(_, size)| *size > 0) {
        let id = mem.segment_create(name, size)?;
        mem.segment_attach(id, None)?;
        let desc = mem.segment_stat(id)?;
        println!(
            "  {:<10} {:>8} KB  {:?}  {}",
            name.to_string(),
            size >> 10,
            desc.placement,
            desc.protection.map(|p| p.to_string()).unwrap_or_default()
        );
    }

    Ok(())
}
