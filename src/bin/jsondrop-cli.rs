use clap::{Parser, Subcommand};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "jsondrop-cli")]
#[command(about = "CLI for jsondrop", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    /// Write or read key of the database being addressed
    #[arg(short, long, env = "JSONDROP_KEY", global = true)]
    key: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a database and print its id and keys
    CreateDb,
    Info {
        #[arg(short, long)]
        db: String,
    },
    DeleteDb {
        #[arg(short, long)]
        db: String,
    },
    /// Fields are given as `name:type`, type one of string, number, bool
    CreateSchema {
        #[arg(short, long)]
        db: String,
        #[arg(short, long)]
        name: String,
        #[arg(short, long = "field", required = true)]
        fields: Vec<String>,
    },
    DeleteSchema {
        #[arg(short, long)]
        db: String,
        #[arg(short, long)]
        name: String,
    },
    Insert {
        #[arg(short, long)]
        db: String,
        #[arg(short = 'C', long)]
        collection: String,
        /// Document data as a JSON object
        #[arg(short = 'D', long)]
        data: String,
    },
    Get {
        #[arg(short, long)]
        db: String,
        #[arg(short = 'C', long)]
        collection: String,
        #[arg(short, long)]
        id: String,
    },
    Update {
        #[arg(short, long)]
        db: String,
        #[arg(short = 'C', long)]
        collection: String,
        #[arg(short, long)]
        id: String,
        #[arg(short = 'D', long)]
        data: String,
    },
    Delete {
        #[arg(short, long)]
        db: String,
        #[arg(short = 'C', long)]
        collection: String,
        #[arg(short, long)]
        id: String,
    },
    /// Query a collection, newest first
    Query {
        #[arg(short, long)]
        db: String,
        #[arg(short = 'C', long)]
        collection: String,
        /// `field=value`, repeatable
        #[arg(short, long = "filter")]
        filters: Vec<String>,
        #[arg(short, long)]
        limit: Option<usize>,
        #[arg(short, long)]
        offset: Option<usize>,
    },
}

fn with_key(req: RequestBuilder, key: &Option<String>) -> RequestBuilder {
    match key {
        Some(key) => req.bearer_auth(key),
        None => req,
    }
}

fn parse_data(raw: &str) -> Result<Value, Box<dyn std::error::Error>> {
    let value: Value = serde_json::from_str(raw)?;
    if !value.is_object() {
        return Err("data must be a JSON object".into());
    }
    Ok(value)
}

fn parse_fields(raw: &[String]) -> Result<Value, Box<dyn std::error::Error>> {
    let mut fields = serde_json::Map::new();
    for item in raw {
        let (name, kind) = item
            .split_once(':')
            .ok_or_else(|| format!("field must be name:type, got {}", item))?;
        fields.insert(name.to_string(), Value::String(kind.to_string()));
    }
    Ok(Value::Object(fields))
}

fn parse_filters(raw: &[String]) -> Result<Vec<(String, String)>, Box<dyn std::error::Error>> {
    raw.iter()
        .map(|item| {
            item.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| format!("filter must be field=value, got {}", item).into())
        })
        .collect()
}

async fn print(res: Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let body = res.text().await?;
    let pretty = serde_json::from_str::<Value>(&body)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or(body);
    if status.is_success() {
        println!("{}", pretty);
    } else {
        println!("Error ({}): {}", status, pretty);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = Client::new();
    let api = format!("{}/api/databases", cli.url.trim_end_matches('/'));
    let key = cli.key;

    let res = match cli.command {
        Commands::CreateDb => client.post(&api).send().await?,
        Commands::Info { db } => {
            with_key(client.get(format!("{}/{}", api, db)), &key)
                .send()
                .await?
        }
        Commands::DeleteDb { db } => {
            with_key(client.delete(format!("{}/{}", api, db)), &key)
                .send()
                .await?
        }
        Commands::CreateSchema { db, name, fields } => {
            let body = json!({ "fields": parse_fields(&fields)? });
            with_key(client.post(format!("{}/{}/schemas/{}", api, db, name)), &key)
                .json(&body)
                .send()
                .await?
        }
        Commands::DeleteSchema { db, name } => {
            with_key(client.delete(format!("{}/{}/schemas/{}", api, db, name)), &key)
                .send()
                .await?
        }
        Commands::Insert { db, collection, data } => {
            let body = json!({ "data": parse_data(&data)? });
            with_key(client.post(format!("{}/{}/{}", api, db, collection)), &key)
                .json(&body)
                .send()
                .await?
        }
        Commands::Get { db, collection, id } => {
            with_key(client.get(format!("{}/{}/{}/{}", api, db, collection, id)), &key)
                .send()
                .await?
        }
        Commands::Update { db, collection, id, data } => {
            let body = json!({ "data": parse_data(&data)? });
            with_key(client.put(format!("{}/{}/{}/{}", api, db, collection, id)), &key)
                .json(&body)
                .send()
                .await?
        }
        Commands::Delete { db, collection, id } => {
            with_key(client.delete(format!("{}/{}/{}/{}", api, db, collection, id)), &key)
                .send()
                .await?
        }
        Commands::Query { db, collection, filters, limit, offset } => {
            let mut params = parse_filters(&filters)?;
            if let Some(limit) = limit {
                params.push(("limit".to_string(), limit.to_string()));
            }
            if let Some(offset) = offset {
                params.push(("offset".to_string(), offset.to_string()));
            }
            with_key(client.get(format!("{}/{}/{}", api, db, collection)), &key)
                .query(&params)
                .send()
                .await?
        }
    };

    print(res).await
}
