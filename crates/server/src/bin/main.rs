use askql_server::AskqlServer;

#[derive(clap::Parser)]
#[command(name = "askql-server", about = "Ask questions of your MySQL data in plain language")]
struct Args {
    /// Path to the YAML configuration file; ASKQL_* variables override it.
    #[arg(long, default_value = "config/askql.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = <Args as clap::Parser>::parse();

    AskqlServer::new().with_config(args.config).run().await
}
