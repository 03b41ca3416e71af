use std::{fs, io, path::PathBuf, process};

use clap::{error::ErrorKind, Parser};
use env_logger::Env;
use ljmd::{
    catalog::{Catalog, DeviceRequest},
    checkpoint::Checkpoint,
    config::{MdInput, TransferMode},
    output::OutputFiles,
    program::{BuildOptions, KERNEL_SOURCE},
    reference::ReferenceSim,
    restart::{read_restart, write_restart},
    units::{PhysConstants, Precision},
    LjmdError, LjmdResult, RunOptions, Simulation, SimulationState,
};

fn parse_threads(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("thread count must be a positive integer; got {s}")),
    }
}

/// Lennard-Jones MD. Reads the run description from stdin.
#[derive(Parser, Debug)]
#[command(name = "ljmd", version)]
struct Cli {
    /// Device kind, with an optional count: `cpu`, `gpu`, `cpu:3`.
    #[arg(required_unless_present_any = ["list_devices", "reference"])]
    device: Option<DeviceRequest>,

    /// Work items per device. Defaults to 16 on CPUs and 1024 on GPUs.
    #[arg(value_parser = parse_threads)]
    threads: Option<usize>,

    /// `blocking` or `async`.
    #[arg(long, default_value = "blocking")]
    transfer: TransferMode,

    /// `double` or `single`.
    #[arg(long, default_value = "double")]
    precision: Precision,

    /// Compile kernels from this file instead of the built-in source. Host devices only check
    /// that the file declares the five kernels, then run their built-in versions.
    #[arg(long)]
    kernel_source: Option<PathBuf>,

    /// Write final positions and velocities as a restart file.
    #[arg(long)]
    write_restart: Option<PathBuf>,

    /// Save the final state as a binary checkpoint.
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Start from a checkpoint instead of the restart file named in the input.
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Run the serial host integrator; no devices are used.
    #[arg(long)]
    reference: bool,

    /// List platforms and devices, then exit.
    #[arg(long)]
    list_devices: bool,
}

fn run(cli: Cli) -> LjmdResult<()> {
    let catalog = Catalog::discover();

    if cli.list_devices {
        print!("{}", catalog.report());
        return Ok(());
    }

    // Devices are set up before the input is read, so a missing device fails fast.
    let devices = match (&cli.device, cli.reference) {
        (Some(request), false) => Some((*request, catalog.select(request)?)),
        (None, false) => return Err(LjmdError::Usage("a device kind is required".to_owned())),
        (_, true) => None,
    };

    let input = MdInput::parse(&mut io::stdin().lock())?;

    let state = match &cli.resume {
        Some(path) => Checkpoint::load(path)?.resume(&input)?,
        None => SimulationState::new(&input, read_restart(&input.restart_path, input.natoms)?),
    };

    let mut out = OutputFiles::create(&input.erg_path, &input.traj_path)?;
    let consts = PhysConstants::default();
    out.announce(state.natoms, state.nsteps);

    let final_state = match devices {
        Some((request, devices)) => {
            let source = match &cli.kernel_source {
                Some(path) => fs::read_to_string(path).map_err(|e| LjmdError::io(path, e))?,
                None => KERNEL_SOURCE.to_owned(),
            };

            let opts = RunOptions {
                nthreads: cli.threads.unwrap_or(request.kind.default_threads()),
                transfer: cli.transfer,
                build: BuildOptions {
                    precision: cli.precision,
                    ..Default::default()
                },
                source,
                consts,
            };

            let mut sim = Simulation::new(&devices, state, input.nprint, &opts)?;
            sim.run(&mut out)?;
            sim.into_state()
        }
        None => {
            let mut sim = ReferenceSim::new(state, input.nprint, consts)?;
            sim.run(&mut out)?;
            sim.into_state()
        }
    };
    out.flush()?;
    out.done();

    if let Some(path) = &cli.write_restart {
        write_restart(path, &final_state.phase_space())?;
    }
    if let Some(path) = &cli.checkpoint {
        Checkpoint::new(final_state).save(path)?;
    }

    Ok(())
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = match Cli::try_parse() {
        Ok(c) => c,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            process::exit(code);
        }
    };

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(e.exit_code());
    }
}
