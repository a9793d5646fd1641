use std::path::PathBuf;

use spacefeed::RunOptions;

fn main() {
    let opts = match handle_cli_flags() {
        Ok(Some(opts)) => opts,
        Ok(None) => return,
        Err(message) => {
            eprintln!("error: {message}");
            std::process::exit(2);
        }
    };

    if let Err(err) = spacefeed::run(opts) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

/// Returns `None` when a flag was handled and the program should exit.
fn handle_cli_flags() -> Result<Option<RunOptions>, String> {
    let mut opts = RunOptions::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("spacefeed {}", spacefeed::VERSION);
                return Ok(None);
            }
            "--help" | "-h" => {
                println!(
                    "spacefeed - Browse a social feed from the terminal.\n\n  --version, -V          Show version and exit\n  --help,    -h          Show this help message\n  --config <path>        Read configuration from <path>\n  --fixture <path>       Serve posts and comments from a JSON fixture\n  --fail-mutations       Make every vote and bookmark fail (rollback demo)"
                );
                return Ok(None);
            }
            "--config" => {
                let path = args.next().ok_or("--config needs a path")?;
                opts.config_file = Some(PathBuf::from(path));
            }
            "--fixture" => {
                let path = args.next().ok_or("--fixture needs a path")?;
                opts.fixture = Some(PathBuf::from(path));
            }
            "--fail-mutations" => opts.fail_mutations = true,
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(Some(opts))
}
