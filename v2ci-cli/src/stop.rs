use clap::Parser;

/// Stop the rootless v2ci daemon.
///
/// Sends SIGTERM to the supervisor and to every project worker named in
/// the configuration. Workers finish their in-flight build phases before
/// exiting. Always exits 0.
#[derive(Parser)]
#[command(name = "v2ci-stop", version, about = "stop the rootless v2ci daemon")]
struct Cli {}

fn main() {
    let _cli = Cli::parse();
    if let Err(err) = v2ci_core::stop::stop() {
        eprintln!("v2ci-stop: {err:#}");
    }
}
