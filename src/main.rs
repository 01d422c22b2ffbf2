use flexi_logger::{Duplicate, FileSpec, Logger, WriteMode};
use log::{error, info, warn};
use recoxval::param;
use recoxval::run;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn main() {
    let param_path = std::env::args().nth(1).unwrap_or_else(|| "param.yaml".to_string());

    let param = match param::get(param_path.clone()) {
        Ok(param) => param,
        Err(e) => {
            eprintln!("Cannot load parameters from {}: {}", param_path, e);
            std::process::exit(1);
        }
    };

    let logger = Logger::try_with_env_or_str(&param.general.log_level)
        .map(|logger| {
            if param.general.log_base.is_empty() {
                logger.log_to_stdout()
            } else {
                logger
                    .log_to_file(FileSpec::default()
                        .basename(&param.general.log_base)
                        .suffix(&param.general.log_suffix))
                    .duplicate_to_stderr(Duplicate::Info)
                    .write_mode(WriteMode::BufferAndFlush)
            }
        })
        .and_then(|logger| logger.start());
    let _logger = match logger {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Cannot start logger: {}", e);
            std::process::exit(1);
        }
    };

    info!("recoxval v{}", recoxval::recoxval_version());

    // A signal stops the dispatch of new rounds; running units finish
    let running = Arc::new(AtomicBool::new(true));
    match Signals::new([SIGINT, SIGTERM]) {
        Ok(mut signals) => {
            let flag = Arc::clone(&running);
            thread::spawn(move || {
                for signal in signals.forever() {
                    warn!("Received signal {}, stopping after the running experiments...", signal);
                    flag.store(false, Ordering::Relaxed);
                }
            });
        }
        Err(e) => warn!("Cannot register signal handlers: {}", e),
    }

    let experiment = match run(&param, running) {
        Ok(experiment) => experiment,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    recoxval::cinfo!(param.general.display_colorful, "{}", experiment.display_results());

    if !param.general.save_exp.is_empty() {
        match experiment.save_auto(&param.general.save_exp) {
            Ok(()) => info!("Experiment saved to {}", param.general.save_exp),
            Err(e) => error!("Cannot save experiment to {}: {}", param.general.save_exp, e),
        }
    }
    if !param.general.csv_path.is_empty() {
        if let Err(e) = experiment.export_csv(&param.general.csv_path, param.general.csv_append) {
            error!("Cannot write results to {}: {}", param.general.csv_path, e);
        }
    }
}
