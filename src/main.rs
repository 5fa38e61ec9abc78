//! Offline certificate tool.
//!
//! Issues the certificates that peers pin their trust to: generate Ed25519
//! keypairs, and sign certificates binding a public key to an identity and
//! its restriction set. Runs entirely offline; the CA private key never
//! leaves the machine this runs on.
//!
//! ```text
//! certtool gen_keypair
//! certtool --ca-priv-key-file ca.key --identity steamid:157626 \
//!          --app 480 --expiry 365 gen_keypair create_cert
//! certtool --ca-priv-key-file ca.key --pub-key-file server.pub \
//!          --pop iad,ord create_cert
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use steamnet::cert::{
    cert_to_text, create_cert, pack_pop_id, private_key_from_text, private_key_to_text,
    public_key_from_authorized_keys, public_key_to_authorized_keys, CertParams,
    DEFAULT_CERT_EXPIRY_DAYS,
};
use steamnet::identity::{key_id_for_public_key, Keypair, NetIdentity};

#[derive(Parser, Debug)]
#[command(name = "certtool")]
#[command(version, about = "Generate keypairs and issue signed certificates")]
struct Args {
    /// Commands to run, in order: `gen_keypair`, `create_cert`.
    #[arg(required = true, value_name = "COMMAND")]
    commands: Vec<String>,

    /// Load the CA master private key from a file (PEM-like blob).
    #[arg(long, value_name = "FILENAME")]
    ca_priv_key_file: Option<PathBuf>,

    /// Load the subject public key from a file (authorized_keys form).
    #[arg(long, value_name = "FILENAME")]
    pub_key_file: Option<PathBuf>,

    /// Use a specific subject public key (authorized_keys blob).
    #[arg(long, value_name = "KEY")]
    pub_key: Option<String>,

    /// Identity the cert is issued to (e.g. `steamid:157626`).
    #[arg(long, value_name = "IDENTITY")]
    identity: Option<String>,

    /// Restrict to relay region POP(s) (3- or 4-character codes).
    #[arg(long, value_name = "CODE[,CODE...]", value_delimiter = ',')]
    pop: Vec<String>,

    /// Restrict to application ID(s).
    #[arg(long, value_name = "APPID[,APPID...]", value_delimiter = ',')]
    app: Vec<u32>,

    /// Cert expires in this many days.
    #[arg(long, value_name = "DAYS", default_value_t = DEFAULT_CERT_EXPIRY_DAYS)]
    expiry: u64,

    /// Emit machine-readable JSON instead of text blocks.
    #[arg(long)]
    output_json: bool,
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Exit 0 on success, 1 on argument/usage errors.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprint!("{e}");
            return ExitCode::FAILURE;
        }
    };
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("certtool: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    for command in &args.commands {
        if !matches!(command.as_str(), "gen_keypair" | "create_cert") {
            bail!("unknown command '{command}' (expected gen_keypair or create_cert)");
        }
    }

    let mut generated: Option<Keypair> = None;
    for command in &args.commands {
        match command.as_str() {
            "gen_keypair" => {
                let keypair = gen_keypair(&args)?;
                generated = Some(keypair);
            }
            "create_cert" => create_cert_cmd(&args, generated.as_ref())?,
            _ => unreachable!("validated above"),
        }
    }
    Ok(())
}

/// Comment embedded in the authorized_keys line, describing the
/// restriction set the key is meant to be certified with.
fn key_comment(args: &Args) -> String {
    let mut parts = Vec::new();
    if let Some(identity) = &args.identity {
        parts.push(identity.clone());
    }
    for app in &args.app {
        parts.push(format!("app{app}"));
    }
    if !args.pop.is_empty() {
        parts.push(args.pop.join(","));
    }
    parts.join(" ")
}

fn gen_keypair(args: &Args) -> Result<Keypair> {
    let keypair = Keypair::generate();
    let public_line = public_key_to_authorized_keys(&keypair.public_key_bytes(), &key_comment(args));
    if args.output_json {
        let out = serde_json::json!({
            "private_key": private_key_to_text(&keypair),
            "public_key": public_line,
            "key_id": keypair.key_id().to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&out).expect("valid JSON"));
    } else {
        println!("Key ID: {}", keypair.key_id());
        println!("{public_line}");
        print!("{}", private_key_to_text(&keypair));
    }
    Ok(keypair)
}

fn load_subject_key(args: &Args, generated: Option<&Keypair>) -> Result<[u8; 32]> {
    if let Some(keypair) = generated {
        return Ok(keypair.public_key_bytes());
    }
    if let Some(blob) = &args.pub_key {
        return public_key_from_authorized_keys(blob)
            .context("--pub-key is not a valid authorized_keys Ed25519 public key");
    }
    if let Some(path) = &args.pub_key_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        return public_key_from_authorized_keys(text.trim()).with_context(|| {
            format!(
                "{} does not contain a valid authorized_keys Ed25519 public key",
                path.display()
            )
        });
    }
    bail!("create_cert needs a subject key: gen_keypair, --pub-key, or --pub-key-file");
}

fn create_cert_cmd(args: &Args, generated: Option<&Keypair>) -> Result<()> {
    let ca_path = args
        .ca_priv_key_file
        .as_ref()
        .context("create_cert requires --ca-priv-key-file")?;
    let ca_text = std::fs::read_to_string(ca_path)
        .with_context(|| format!("reading {}", ca_path.display()))?;
    let ca = private_key_from_text(&ca_text)
        .with_context(|| format!("{} is not a valid private key block", ca_path.display()))?;

    let identity = match &args.identity {
        Some(s) => Some(
            NetIdentity::parse(s).with_context(|| format!("invalid identity '{s}'"))?,
        ),
        None => None,
    };
    let mut pop_ids = Vec::with_capacity(args.pop.len());
    for code in &args.pop {
        pop_ids.push(pack_pop_id(code).with_context(|| format!("invalid POP code '{code}'"))?);
    }
    if !pop_ids.is_empty() && !args.app.is_empty() {
        bail!("a cert carries either --app or --pop restrictions, not both");
    }

    let public_key = load_subject_key(args, generated)?;
    let signed = create_cert(
        &CertParams {
            public_key,
            identity,
            app_ids: args.app.clone(),
            pop_ids,
            expiry_days: args.expiry,
        },
        &ca,
    );

    if args.output_json {
        let out = serde_json::json!({
            "cert": cert_to_text(&signed),
            "ca_key_id": signed.ca_key_id.to_string(),
            "subject_key_id": key_id_for_public_key(&public_key).to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&out).expect("valid JSON"));
    } else {
        print!("{}", cert_to_text(&signed));
    }
    Ok(())
}
