use clap::Parser;

/// Start the rootless v2ci daemon.
///
/// Reads the configuration at ~/.config/v2ci/config.yml, bootstraps one
/// chroot per architecture and forks a polling worker per project. Exits 0
/// once the daemon is detached; progress is reported in the main log file.
#[derive(Parser)]
#[command(name = "v2ci-start", version, about = "start the rootless v2ci daemon")]
struct Cli {}

fn main() {
    let _cli = Cli::parse();
    if let Err(err) = v2ci_core::supervisor::start() {
        eprintln!("v2ci-start: {err:#}");
        std::process::exit(1);
    }
}
