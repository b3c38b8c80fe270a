use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "balancer-cli")]
#[command(about = "Management CLI for the load balancer", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    /// Admin API key, sent as a bearer token when given.
    #[arg(short, long, env = "BALANCER_API_KEY")]
    key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List backends with liveness and in-flight requests
    Backends,
    /// Create or replace a client rate limit
    SetClient {
        client_id: String,
        /// Requests allowed per period
        rate: u32,
        /// Period such as "1s", "500ms" or "1m"
        period: String,
    },
    /// Remove a client rate limit
    RemoveClient { client_id: String },
    /// Show the limit in force for a client
    GetClient { client_id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    if let Some(key) = &cli.key {
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {key}"))?);
    }

    let request = match cli.command {
        Commands::Backends => client.get(format!("{}/admin/backends", cli.url)),
        Commands::SetClient {
            client_id,
            rate,
            period,
        } => client
            .post(format!("{}/clients", cli.url))
            .json(&json!({ "client_id": client_id, "rate": rate, "period": period })),
        Commands::RemoveClient { client_id } => client
            .delete(format!("{}/clients", cli.url))
            .query(&[("client_id", client_id)]),
        Commands::GetClient { client_id } => {
            client.get(format!("{}/clients/{}", cli.url, client_id))
        }
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    if !status.is_success() {
        eprintln!("Error: balancer returned status {status}");
        eprintln!("Response: {text}");
        std::process::exit(1);
    }

    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{text}"),
    }
    Ok(())
}
