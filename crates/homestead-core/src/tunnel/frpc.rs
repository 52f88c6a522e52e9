//! Tunnel client configuration rendering (frp client TOML format).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::TunnelError;
use super::claim::SignedClaim;

/// Header the tunnel client stamps on forwarded requests so the HTTP layer
/// can tell tunnel traffic apart.
pub const TUNNEL_TRANSPORT_HEADER: &str = "x-ps-transport";

const HEADER: &str = "# Generated by homestead; rewritten on every tunnel start.\n\n";

/// Everything the rendered config binds together.
#[derive(Debug, Clone)]
pub struct FrpcOptions<'a> {
    pub server_addr: &'a str,
    pub server_port: u16,
    pub local_port: u16,
    pub owner: &'a str,
    pub claim: &'a SignedClaim,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FrpcFile<'a> {
    server_addr: &'a str,
    server_port: u16,
    login_fail_exit: bool,
    metadatas: Metadatas<'a>,
    proxies: Vec<Proxy<'a>>,
}

#[derive(Debug, Serialize)]
struct Metadatas<'a> {
    wallet: &'a str,
    owner: &'a str,
    run_id: &'a str,
    auth_claim: &'a str,
    auth_sig: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Proxy<'a> {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "localIP")]
    local_ip: &'static str,
    local_port: u16,
    subdomain: &'a str,
    request_headers: RequestHeaders,
}

#[derive(Debug, Serialize)]
struct RequestHeaders {
    set: BTreeMap<&'static str, &'static str>,
}

/// Proxy names must be unique on the broker; the run id prefix keeps
/// concurrent or stale sessions apart.
pub fn derive_proxy_name(run_id: &str) -> String {
    let prefix: String = run_id.chars().take(8).collect();
    format!("ps-{prefix}")
}

/// Render the config file contents.
pub fn render(options: &FrpcOptions<'_>) -> Result<String, TunnelError> {
    let payload = &options.claim.payload;
    let file = FrpcFile {
        server_addr: options.server_addr,
        server_port: options.server_port,
        // The client keeps retrying login on its own after an auth failure.
        login_fail_exit: false,
        metadatas: Metadatas {
            wallet: &payload.wallet,
            owner: options.owner,
            run_id: &payload.run_id,
            auth_claim: &options.claim.claim,
            auth_sig: &options.claim.sig,
        },
        proxies: vec![Proxy {
            name: derive_proxy_name(&payload.run_id),
            kind: "http",
            local_ip: "127.0.0.1",
            local_port: options.local_port,
            subdomain: &payload.subdomain,
            request_headers: RequestHeaders {
                set: BTreeMap::from([(TUNNEL_TRANSPORT_HEADER, "tunnel")]),
            },
        }],
    };

    let body = toml::to_string(&file)?;
    Ok(format!("{HEADER}{body}"))
}

/// Path of the rendered config under the storage root.
pub fn config_path(storage_root: &Path) -> PathBuf {
    storage_root.join("tunnel").join("frpc.toml")
}

/// Render and write the config, returning its path.
pub async fn write_config(
    storage_root: &Path,
    options: &FrpcOptions<'_>,
) -> Result<PathBuf, TunnelError> {
    let contents = render(options)?;
    let path = config_path(storage_root);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, contents).await?;
    Ok(path)
}
