//! TEE Vault CLI: keys, secrets and sealed records from the command line
//!
//! Commands:
//!   teevault status  - enclave and store summary
//!   teevault key     - generate, rotate and use keys
//!   teevault secret  - per-user secret vault
//!   teevault store   - raw sealed records

use std::env;
use std::path::Path;
use tee_vault_core::{CoreError, EnclaveConfig, EnclaveRuntime, KeyType, Result};

const CONFIG_FILE: &str = "tee-vault.json";
const CONFIG_ENV: &str = "TEE_VAULT_CONFIG";

fn print_usage() {
    println!(
        r#"
TEE Vault v{}: key management, sealed storage and secret vault

Usage: teevault <command> [options]

Commands:
  status                                     Enclave and store summary
  key gen     <type> [bits] [days]           Generate a key (type: symmetric|rsa|ec)
  key rotate  <type> [bits] [days]           Deactivate the current key and replace it
  key list                                   List keys
  key show    <id>                           Show key metadata
  key delete  <id>                           Delete an inactive key
  key encrypt <id> <hex>                     Encrypt hex bytes
  key decrypt <id> <hex>                     Decrypt hex bytes
  key sign    <id> <hex>                     Sign hex bytes
  key verify  <id> <hex> <signature-hex>     Verify a signature
  secret put    <user> <name> <value>        Store a secret
  secret get    <user> <name>                Print a secret
  secret delete <user> <name>                Delete a secret
  secret list   <user>                       List a user's secret names
  secret export <user>                       Print all of a user's secrets as JSON
  store put <namespace> <key> <value>        Write a sealed record
  store get <namespace> <key>                Read a sealed record
  store rm  <namespace> <key>                Remove a sealed record
  store ls  <namespace>                      List record keys

Configuration: ./{} or ${}, then TEE_VAULT_* environment overrides.

Examples:
  teevault key gen ec 384 90
  teevault key encrypt <id> 68656c6c6f
  teevault secret put alice api_key s3cr3t
  teevault secret export alice
"#,
        env!("CARGO_PKG_VERSION"),
        CONFIG_FILE,
        CONFIG_ENV
    );
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let result = match args[1].as_str() {
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        "status" => start().and_then(|rt| cmd_status(&rt)),
        "key" => start().and_then(|rt| cmd_key(&rt, &args[2..])),
        "secret" => start().and_then(|rt| cmd_secret(&rt, &args[2..])),
        "store" => start().and_then(|rt| cmd_store(&rt, &args[2..])),
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            std::process::exit(2);
        }
    };

    if let Err(e) = result {
        eprintln!("  Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config() -> Result<EnclaveConfig> {
    if let Ok(path) = env::var(CONFIG_ENV) {
        return EnclaveConfig::load(path);
    }
    if Path::new(CONFIG_FILE).is_file() {
        return EnclaveConfig::load(CONFIG_FILE);
    }
    EnclaveConfig::from_env()
}

fn start() -> Result<EnclaveRuntime> {
    let config = load_config()?;
    EnclaveRuntime::start(&config)
}

fn usage(text: &str) -> CoreError {
    CoreError::InvalidInput(format!("usage: teevault {}", text))
}

fn arg<'a>(args: &'a [String], index: usize, text: &str) -> Result<&'a str> {
    args.get(index).map(|s| s.as_str()).ok_or_else(|| usage(text))
}

fn parse_hex(value: &str) -> Result<Vec<u8>> {
    hex::decode(value.trim())
        .map_err(|e| CoreError::InvalidInput(format!("expected hex bytes: {}", e)))
}

fn parse_number(value: Option<&String>, default: u32, what: &str) -> Result<u32> {
    match value {
        Some(v) => v
            .parse()
            .map_err(|_| CoreError::InvalidInput(format!("{} must be a number, got '{}'", what, v))),
        None => Ok(default),
    }
}

fn format_time(secs: u64) -> String {
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn cmd_status(rt: &EnclaveRuntime) -> Result<()> {
    let status = rt.enclave.status();
    let config = rt.config();

    println!("\n  TEE Vault Status");
    println!("  {}", "=".repeat(40));
    println!("  Enclave ID:      {}", &status.enclave_id[..8]);
    println!("  Backend:         {}", status.backend.name());
    println!("  Security Level:  {:?}", status.security_level);
    println!("  Healthy:         {}", status.is_healthy);
    println!("  Root Key:        {}...", &status.root_public_key[..16]);
    if config.ephemeral {
        println!("  Storage:         memory (ephemeral)");
    } else {
        println!("  Storage:         {}", config.sealed_dir().display());
    }
    println!("  Expiration:      {:?}", config.expiration_policy);
    println!("  Keys:            {}", rt.keys.list_keys().len());
    for key_type in [KeyType::Symmetric, KeyType::RsaAsymmetric, KeyType::EcAsymmetric] {
        if let Ok(record) = rt.keys.get_active_key(key_type) {
            println!("  Active {:<10} {}", format!("{}:", key_type.name()), record.id);
        }
    }
    println!("  Seals/Unseals:   {}/{}", status.seal_operations, status.unseal_operations);
    Ok(())
}

fn cmd_key(rt: &EnclaveRuntime, args: &[String]) -> Result<()> {
    let subcmd = args.first().map(|s| s.as_str()).unwrap_or("list");
    let config = rt.config();

    match subcmd {
        "gen" | "rotate" => {
            let text = "key gen|rotate <type> [bits] [days]";
            let key_type = KeyType::parse(arg(args, 1, text)?).ok_or_else(|| usage(text))?;
            let default_bits = match key_type {
                KeyType::Symmetric => config.symmetric_bits,
                KeyType::RsaAsymmetric => config.rsa_bits,
                KeyType::EcAsymmetric => config.ec_bits,
            };
            let bits = parse_number(args.get(2), default_bits, "bits")?;
            let days = parse_number(args.get(3), config.expiration_days, "days")?;

            let id = if subcmd == "gen" {
                rt.keys.generate_key(key_type, bits, days)?
            } else {
                rt.keys.rotate_key(key_type, bits, days)?
            };
            let info = rt.keys.key_info(&id)?;
            println!("  {} {} key", if subcmd == "gen" { "Generated" } else { "Rotated to" }, info.algorithm);
            println!("  ID:      {}", id);
            println!("  Expires: {}", format_time(info.expires_at));
        }
        "list" => {
            let keys = rt.keys.list_key_info();
            if keys.is_empty() {
                println!("  No keys");
                return Ok(());
            }
            println!("\n  {:<34} {:<13} {:<8} {}", "ID", "ALGORITHM", "STATE", "EXPIRES");
            for info in keys {
                let state = match (info.current, info.active) {
                    (true, _) => "current",
                    (false, true) => "active",
                    (false, false) => "retired",
                };
                println!(
                    "  {:<34} {:<13} {:<8} {}",
                    info.id,
                    info.algorithm,
                    state,
                    format_time(info.expires_at)
                );
            }
        }
        "show" => {
            let info = rt.keys.key_info(arg(args, 1, "key show <id>")?)?;
            println!("  ID:        {}", info.id);
            println!("  Type:      {}", info.key_type.name());
            println!("  Algorithm: {}", info.algorithm);
            println!("  Created:   {}", format_time(info.created_at));
            println!("  Expires:   {}", format_time(info.expires_at));
            println!("  Active:    {}", info.active);
            println!("  Current:   {}", info.current);
        }
        "delete" => {
            let id = arg(args, 1, "key delete <id>")?;
            rt.keys.delete_key(id)?;
            println!("  Deleted key {}", id);
        }
        "encrypt" => {
            let text = "key encrypt <id> <hex>";
            let data = parse_hex(arg(args, 2, text)?)?;
            println!("{}", hex::encode(rt.keys.encrypt(arg(args, 1, text)?, &data)?));
        }
        "decrypt" => {
            let text = "key decrypt <id> <hex>";
            let data = parse_hex(arg(args, 2, text)?)?;
            println!("{}", hex::encode(rt.keys.decrypt(arg(args, 1, text)?, &data)?));
        }
        "sign" => {
            let text = "key sign <id> <hex>";
            let data = parse_hex(arg(args, 2, text)?)?;
            println!("{}", hex::encode(rt.keys.sign(arg(args, 1, text)?, &data)?));
        }
        "verify" => {
            let text = "key verify <id> <hex> <signature-hex>";
            let data = parse_hex(arg(args, 2, text)?)?;
            let signature = parse_hex(arg(args, 3, text)?)?;
            let valid = rt.keys.verify(arg(args, 1, text)?, &data, &signature)?;
            println!("  Signature {}", if valid { "VALID" } else { "INVALID" });
            if !valid {
                std::process::exit(3);
            }
        }
        other => return Err(CoreError::InvalidInput(format!("unknown key command '{}'", other))),
    }
    Ok(())
}

fn cmd_secret(rt: &EnclaveRuntime, args: &[String]) -> Result<()> {
    let subcmd = args.first().map(|s| s.as_str()).unwrap_or("");

    match subcmd {
        "put" => {
            let text = "secret put <user> <name> <value>";
            let (user, name) = (arg(args, 1, text)?, arg(args, 2, text)?);
            rt.secrets.store_secret(user, name, arg(args, 3, text)?.as_bytes())?;
            println!("  Stored secret '{}' for {}", name, user);
        }
        "get" => {
            let text = "secret get <user> <name>";
            let value = rt.secrets.get_secret(arg(args, 1, text)?, arg(args, 2, text)?)?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        "delete" => {
            let text = "secret delete <user> <name>";
            let (user, name) = (arg(args, 1, text)?, arg(args, 2, text)?);
            rt.secrets.delete_secret(user, name)?;
            println!("  Deleted secret '{}' for {}", name, user);
        }
        "list" => {
            let user = arg(args, 1, "secret list <user>")?;
            let names = rt.secrets.list_secrets(user)?;
            if names.is_empty() {
                println!("  No secrets for {}", user);
            }
            for name in names {
                println!("  {}", name);
            }
        }
        "export" => {
            let json = rt.secrets.user_secrets_json(arg(args, 1, "secret export <user>")?)?;
            println!("{}", json.as_str());
        }
        _ => return Err(usage("secret put|get|delete|list|export ...")),
    }
    Ok(())
}

fn cmd_store(rt: &EnclaveRuntime, args: &[String]) -> Result<()> {
    let subcmd = args.first().map(|s| s.as_str()).unwrap_or("");

    match subcmd {
        "put" => {
            let text = "store put <namespace> <key> <value>";
            rt.storage
                .store(arg(args, 1, text)?, arg(args, 2, text)?, arg(args, 3, text)?.as_bytes())?;
            println!("  Stored");
        }
        "get" => {
            let text = "store get <namespace> <key>";
            let data = rt.storage.retrieve(arg(args, 1, text)?, arg(args, 2, text)?)?;
            match std::str::from_utf8(&data) {
                Ok(s) => println!("{}", s),
                Err(_) => println!("{}", hex::encode(data.as_slice())),
            }
        }
        "rm" => {
            let text = "store rm <namespace> <key>";
            let (namespace, key) = (arg(args, 1, text)?, arg(args, 2, text)?);
            if rt.storage.remove(namespace, key)? {
                println!("  Removed {}/{}", namespace, key);
            } else {
                return Err(CoreError::NotFound(format!("{}/{}", namespace, key)));
            }
        }
        "ls" => {
            for key in rt.storage.list_keys(arg(args, 1, "store ls <namespace>")?)? {
                println!("  {}", key);
            }
        }
        _ => return Err(usage("store put|get|rm|ls ...")),
    }
    Ok(())
}
