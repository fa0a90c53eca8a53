use std::{net::SocketAddr, str::FromStr};

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use clap::{ArgAction, Parser};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use url::Url;

const DNS_CONTENT_TYPE: &str = "application/dns-message";

#[derive(Parser, Debug)]
#[command(name = "arcane-probe", version, about = "Send a DNS-over-HTTPS query and print the answer", long_about = None)]
struct ProbeCli {
    /// DoH endpoint, e.g. https://dns.arcane.m-rots.com/dns-query
    #[arg(long)]
    endpoint: Url,

    /// Domain name to query.
    #[arg(long, default_value = "example.com")]
    name: String,

    /// Record type to ask for (A, AAAA, MX, ...).
    #[arg(long = "type", default_value = "A", value_parser = parse_record_type)]
    record_type: RecordType,

    /// Send the query as a POST body instead of a `dns` query parameter.
    #[arg(long, action = ArgAction::SetTrue)]
    post: bool,

    /// Connect to this address instead of resolving the endpoint host.
    #[arg(long, value_name = "ADDR:PORT")]
    resolve: Option<SocketAddr>,

    /// Accept self-signed certificates.
    #[arg(long, action = ArgAction::SetTrue)]
    insecure: bool,

    /// Increase logging verbosity.
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,
}

fn parse_record_type(value: &str) -> Result<RecordType, String> {
    RecordType::from_str(&value.to_ascii_uppercase()).map_err(|err| err.to_string())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        "arcane_probe=debug"
    } else {
        "arcane_probe=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ProbeCli::parse();
    init_tracing(cli.verbose);

    let query = build_query(&cli.name, cli.record_type)?;
    let client = build_client(&cli)?;

    let request = if cli.post {
        client
            .post(cli.endpoint.clone())
            .header(CONTENT_TYPE, DNS_CONTENT_TYPE)
            .body(query)
    } else {
        client.get(get_url(&cli.endpoint, &query))
    };

    info!(endpoint = %cli.endpoint, name = %cli.name, record_type = %cli.record_type, post = cli.post, "Sending query");
    let response = request
        .header(ACCEPT, DNS_CONTENT_TYPE)
        .send()
        .await
        .with_context(|| format!("Request to {} failed", cli.endpoint))?;

    let status = response.status();
    if !status.is_success() {
        bail!("{} answered {status}", cli.endpoint);
    }
    let body = response
        .bytes()
        .await
        .context("Failed to read DoH response body")?;
    debug!(len = body.len(), "Received response");

    let message = Message::from_vec(&body).context("Response is not a DNS message")?;
    println!("{}", summarize(&message));
    for answer in message.answers() {
        println!("{answer}");
    }
    Ok(())
}

fn build_client(cli: &ProbeCli) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().danger_accept_invalid_certs(cli.insecure);
    if let Some(addr) = cli.resolve {
        let host = cli
            .endpoint
            .host_str()
            .context("Endpoint has no host to pin")?;
        builder = builder.resolve(host, addr);
    }
    builder.build().context("Failed to build HTTP client")
}

/// Standard recursive query; id 0 keeps GET requests cacheable.
fn build_query(name: &str, record_type: RecordType) -> Result<Vec<u8>> {
    let name = Name::from_ascii(name).with_context(|| format!("Invalid domain name {name}"))?;
    let mut message = Message::new();
    message
        .set_id(0)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, record_type));
    message.to_vec().context("Failed to encode DNS query")
}

fn get_url(endpoint: &Url, query: &[u8]) -> Url {
    let mut url = endpoint.clone();
    url.query_pairs_mut()
        .append_pair("dns", &URL_SAFE_NO_PAD.encode(query));
    url
}

fn summarize(message: &Message) -> String {
    let mut flags = Vec::new();
    if message.message_type() == MessageType::Response {
        flags.push("qr");
    }
    if message.authoritative() {
        flags.push("aa");
    }
    if message.truncated() {
        flags.push("tc");
    }
    if message.recursion_desired() {
        flags.push("rd");
    }
    if message.recursion_available() {
        flags.push("ra");
    }
    format!(
        ";; id: {}, opcode: {:?}, rcode: {}, flags: {}, questions: {}, answers: {}",
        message.id(),
        message.op_code(),
        message.response_code(),
        flags.join(" "),
        message.queries().len(),
        message.answers().len(),
    )
}
