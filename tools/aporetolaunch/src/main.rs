//! aporetolaunch: run a command under Trireme policy.
//!
//! Registers the command as a processing unit with the RPC monitor and,
//! if the policy allows it, replaces itself with the command via exec.
//! The process that ends up running is the command itself, inside the
//! cgroup and policy scope the control plane assigned.

use std::collections::HashMap;
use std::os::unix::process::CommandExt;
use std::process::ExitCode;

use clap::Parser;
use rpc_wrapper::{RequestPayload, RpcClientManager, RpcStatus, ENV_RPC_SECRET};
use shared_types::{EventInfo, EventType};

/// Default socket of the RPC monitor.
const MONITOR_SOCKET: &str = "/var/run/monitor.sock";

const DENIED_MESSAGE: &str = "Your policy does not allow you to run this command";
const UNREACHABLE_MESSAGE: &str = "Cannot connect to policy process";

#[derive(Parser, Debug)]
#[command(name = "aporetolaunch")]
#[command(version, about = "Command for launching programs with Trireme policy")]
struct Args {
    /// The name of the service to be launched.
    #[arg(short = 's', long = "servicename")]
    servicename: Option<String>,

    /// The command to run.
    #[arg(short = 'c', long = "command")]
    command: String,

    /// Parameters passed to the command.
    #[arg(short = 'p', long = "params", num_args = 0.., allow_hyphen_values = true)]
    params: Vec<String>,

    /// Metadata/labels associated with the service, as key=value.
    #[arg(short = 'm', long = "metadata", value_parser = parse_key_value)]
    metadata: Vec<(String, String)>,

    /// Socket of the policy monitor.
    #[arg(long = "socket", default_value = MONITOR_SOCKET)]
    socket: String,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("metadata must be key=value, got {raw}")),
    }
}

fn build_event(args: &Args) -> EventInfo {
    EventInfo {
        pu_id: args
            .servicename
            .clone()
            .unwrap_or_else(|| args.command.clone()),
        name: args.command.clone(),
        tags: args.metadata.iter().cloned().collect::<HashMap<_, _>>(),
        pid: std::process::id().to_string(),
        event_type: EventType::Create,
        ip_addresses: HashMap::new(),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let event = build_event(&args);

    let secret = hex::decode(std::env::var(ENV_RPC_SECRET).unwrap_or_default())
        .unwrap_or_default();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{UNREACHABLE_MESSAGE}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let response = runtime.block_on(async {
        let clients = RpcClientManager::new();
        clients.new_client_with_secret("monitor", &args.socket, secret);
        clients
            .remote_call("monitor", RequestPayload::HandleEvent(event))
            .await
    });
    drop(runtime);

    match response {
        Ok(response) => match response.status {
            RpcStatus::Success => {
                // Replace this process with the command. exec only
                // returns on failure.
                let err = std::process::Command::new(&args.command)
                    .args(&args.params)
                    .exec();
                eprintln!("Cannot exec {}: {err}", args.command);
                ExitCode::FAILURE
            }
            RpcStatus::Unauthenticated | RpcStatus::Error(_) => {
                eprintln!("{DENIED_MESSAGE}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("{UNREACHABLE_MESSAGE}: {e}");
            ExitCode::FAILURE
        }
    }
}
