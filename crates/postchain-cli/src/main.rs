use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Reverse;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "postchain")]
#[command(about = "CLI client for a postchain node")]
struct Cli {
    /// Node base URL
    #[arg(long, global = true, default_value = "http://127.0.0.1:8000")]
    node: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a post
    Submit {
        #[arg(long)]
        author: String,
        #[arg(long)]
        content: String,
    },
    /// Mine all pending posts into a block
    Mine,
    /// Print the node's chain
    Chain,
    /// Print posts waiting to be mined
    Pending,
    /// Register peers with the node
    AddPeers {
        #[arg(required = true)]
        peers: Vec<String>,
    },
    /// List the node's peers
    Peers,
    /// Ask the node to reconcile with its peers
    Sync,
    /// Print every committed post, newest first
    Posts,
}

#[derive(Serialize)]
struct Post {
    author: String,
    content: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .pretty()
        .init();

    let cli = Cli::parse();
    let node = cli.node.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();

    let request = match cli.cmd {
        Command::Submit { author, content } => client
            .post(format!("{node}/new_transaction"))
            .json(&Post { author, content }),
        Command::Mine => client.get(format!("{node}/mine")),
        Command::Chain => client.get(format!("{node}/chain")),
        Command::Pending => client.get(format!("{node}/pending_transactions")),
        Command::AddPeers { peers } => client.post(format!("{node}/add_nodes")).json(&peers),
        Command::Peers => client.get(format!("{node}/peers")),
        Command::Sync => client.get(format!("{node}/consensus")),
        Command::Posts => return print_posts(&client, &node).await,
    };
    debug!(?request, "sending request");

    let res = request.send().await?;
    let status = res.status();
    let body = res.text().await?;
    println!("status: {}", status);
    println!("{}", pretty(&body));
    Ok(())
}

async fn print_posts(client: &reqwest::Client, node: &str) -> Result<()> {
    let chain: Value = client
        .get(format!("{node}/chain"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&collect_posts(&chain))?);
    Ok(())
}

/// Flatten a `/chain` body into its posts, each tagged with the index and
/// hash of its block, newest `timestamp` first.
fn collect_posts(chain: &Value) -> Vec<Value> {
    let blocks = chain["chain"].as_array().map(Vec::as_slice).unwrap_or_default();
    let mut posts: Vec<Value> = blocks
        .iter()
        .flat_map(|block| {
            let txs = block["transactions"].as_array().map(Vec::as_slice).unwrap_or_default();
            txs.iter().filter_map(move |tx| {
                let mut post = tx.as_object()?.clone();
                post.insert("index".to_string(), block["index"].clone());
                post.insert("hash".to_string(), block["hash"].clone());
                Some(Value::Object(post))
            })
        })
        .collect();
    // Stable, so posts sharing a timestamp keep chain order.
    posts.sort_by_key(|post| Reverse(post["timestamp"].as_u64()));
    posts
}

/// Indent JSON bodies; plain-text bodies pass through.
fn pretty(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_submit() {
        let cli = Cli::try_parse_from(["postchain", "submit", "--author", "a", "--content", "hi"]).unwrap();
        assert_eq!(cli.node, "http://127.0.0.1:8000");
        assert!(matches!(cli.cmd, Command::Submit { ref author, ref content } if author == "a" && content == "hi"));
    }

    #[test]
    fn add_peers_needs_an_address() {
        assert!(Cli::try_parse_from(["postchain", "add-peers"]).is_err());
        let cli = Cli::try_parse_from(["postchain", "--node", "http://n:1", "add-peers", "a:1", "b:2"]).unwrap();
        assert_eq!(cli.node, "http://n:1");
        assert!(matches!(cli.cmd, Command::AddPeers { ref peers } if peers.len() == 2));
    }

    #[test]
    fn posts_are_tagged_and_newest_first() {
        let chain = serde_json::json!({
            "length": 3,
            "chain": [
                {"index": 0, "hash": "g", "transactions": []},
                {"index": 1, "hash": "h1", "transactions": [
                    {"author": "a", "content": "old", "timestamp": 10},
                    {"author": "b", "content": "undated"},
                ]},
                {"index": 2, "hash": "h2", "transactions": [
                    {"author": "c", "content": "new", "timestamp": 30},
                    "not a post",
                    {"author": "d", "content": "mid", "timestamp": 20},
                ]},
            ]
        });
        let posts = collect_posts(&chain);
        let contents: Vec<&str> = posts.iter().map(|p| p["content"].as_str().unwrap()).collect();
        assert_eq!(contents, ["new", "mid", "old", "undated"]);
        assert_eq!(posts[0]["index"], 2);
        assert_eq!(posts[0]["hash"], "h2");
        assert_eq!(posts[2]["hash"], "h1");
    }

    #[test]
    fn posts_of_malformed_body_is_empty() {
        assert!(collect_posts(&serde_json::json!({"chain": "nope"})).is_empty());
        assert!(collect_posts(&Value::Null).is_empty());
    }

    #[test]
    fn pretty_passes_text_through() {
        assert_eq!(pretty("Block #1 has been mined"), "Block #1 has been mined");
        assert_eq!(pretty(r#"{"a":1}"#), "{\n  \"a\": 1\n}");
    }
}
