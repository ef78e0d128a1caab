use clap::Parser;

#[derive(Parser, Debug)]
#[clap(name = "quarkraft-server", version, about = "A replicated, strongly-consistent key-value store")]
struct Args {
    /// Path to the key-value configuration file.
    #[clap(long)]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match quarkraft::Config::parse_file(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("quarkraft-server: {err}");
            std::process::exit(1);
        }
    };

    quarkraft::server::Server::install_tracing(&config);

    let server = match quarkraft::server::Server::bootstrap(config) {
        Ok(server) => server,
        Err(err) => {
            tracing::error!(%err, "failed to bootstrap");
            std::process::exit(1);
        }
    };

    if let Err(err) = server.run().await {
        tracing::error!(%err, "server exited with an error");
        std::process::exit(1);
    }
}
