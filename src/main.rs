use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, error, info};

use micronucleus::{Context, FirmwareImage, Format, UploadOptions, Uploader};

/// Upload programs through the micronucleus USB bootloader.
#[derive(Parser)]
#[command(name = "micronucleus")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Intel HEX or raw file to upload, or `-` to read from stdin
    #[arg(required_unless_present = "erase_only")]
    file: Option<PathBuf>,

    /// Format of the upload file
    #[arg(long = "type", value_enum, default_value = "intel-hex")]
    file_type: Format,

    /// Ask the bootloader to start the program after uploading
    #[arg(long)]
    run: bool,

    /// Print progress as `phase percent` lines for driving GUIs
    #[arg(long)]
    dump_progress: bool,

    /// Erase the device without programming it. Any file is ignored
    #[arg(long)]
    erase_only: bool,

    /// Use the bootloader's timing without safety margin. Do not use if you encounter USB errors
    #[arg(long, env = "MICRONUCLEUS_FAST_MODE")]
    fast_mode: bool,

    /// Give up waiting for the device after this many seconds
    #[arg(long, value_name = "SECONDS", env = "MICRONUCLEUS_TIMEOUT")]
    timeout: Option<u64>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(None)
        .init();

    debug!("micronucleus v{}", env!("CARGO_PKG_VERSION"));

    match upload(&cli) {
        Ok(()) => {
            info!("Done");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{}", err);
            error!("Problem uploading to board. Please unplug the device and try again.");
            ExitCode::FAILURE
        }
    }
}

fn upload(cli: &Cli) -> micronucleus::Result<()> {
    // Parse the input first so a broken file fails fast
    let image = if cli.erase_only {
        None
    } else {
        Some(load_image(cli)?)
    };

    let options = UploadOptions {
        run: cli.run,
        fast_mode: cli.fast_mode,
        erase_only: cli.erase_only,
        timeout: cli.timeout.map(Duration::from_secs),
        ..UploadOptions::default()
    };

    let context = Context::new()?;
    info!("Please connect the device");
    let mut uploader = Uploader::connect(&context, options)?;
    for line in uploader.info().to_string().lines() {
        info!("{}", line);
    }

    if let Some(image) = &image {
        image.check_size(uploader.info().flash_size)?;
    }

    let bar = progress_bar(cli, "Erasing");
    uploader.set_progress(reporter(cli, "erase", bar.clone()));
    uploader.erase()?;
    bar.finish();

    if let Some(image) = &image {
        let bar = progress_bar(cli, "Writing");
        uploader.set_progress(reporter(cli, "write", bar.clone()));
        uploader.write(image)?;
        bar.finish();
    }

    if cli.run {
        uploader.run()?;
    }
    Ok(())
}

fn load_image(cli: &Cli) -> micronucleus::Result<FirmwareImage> {
    let format = cli.file_type;
    match cli.file.as_deref() {
        Some(path) if path.as_os_str() != "-" => {
            info!("Reading input file {}", path.display());
            FirmwareImage::from_path(path, format)
        }
        _ => {
            info!("Reading from stdin");
            FirmwareImage::load(io::stdin().lock(), format)
        }
    }
}

fn progress_bar(cli: &Cli, message: &'static str) -> ProgressBar {
    if cli.quiet || cli.dump_progress {
        return ProgressBar::hidden();
    }

    let bar = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg:8} [{bar:50.cyan/blue}] {pos:>3}%")
            .unwrap()
            .progress_chars("#>-"),
    );
    bar.set_draw_target(ProgressDrawTarget::stderr());
    bar.set_message(message);
    bar
}

fn reporter(cli: &Cli, phase: &'static str, bar: ProgressBar) -> impl FnMut(f32) {
    let dump = cli.dump_progress;
    move |progress: f32| {
        let percent = (progress * 100.0).round() as u64;
        if dump {
            println!("{} {}", phase, percent);
        } else {
            bar.set_position(percent);
        }
    }
}
