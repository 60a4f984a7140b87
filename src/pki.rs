//! Certificate issuance for generated node configuration
//!
//! Key pairs live next to the generated configuration as `<name>.pem` and
//! `<name>-key.pem`. Issuance is idempotent: an existing pair is never
//! regenerated. The cluster CA, the front-proxy CA, the service-account key
//! pair and the etcd pairs live in the apiserver's output directory.
//!
//! Generation wipes the output tree, so pairs already installed on the fleet
//! are fetched back with [`fetch_installed_pki`] before anything is issued.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use openssl::rsa::Rsa;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::topology::{ClusterTopology, Node, Role};
use crate::transport::RemoteTransport;
use crate::{Error, Result};

/// Installed control-plane PKI on the apiserver
pub const APISERVER_PKI_DIR: &str = "/etc/kubernetes/pki";

/// Installed etcd PKI on etcd members
pub const ETCD_PKI_DIR: &str = "/etc/ssl/etcd";

const SERVICE_ACCOUNT_KEY: &str = "sa";
const SERVICE_ACCOUNT_KEY_BITS: u32 = 2048;

/// Request for a CA-signed pair
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssueRequest {
    /// CSR definition
    pub csr: PathBuf,
    /// Signing CA certificate
    pub ca_cert: PathBuf,
    /// Signing CA key
    pub ca_key: PathBuf,
    /// cfssl signing configuration
    pub ca_config: PathBuf,
    /// Directory the pair is written to
    pub out_dir: PathBuf,
    /// Base name of the pair
    pub name: String,
    /// Signing profile from the CA config
    pub profile: String,
}

/// Produces key pairs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Create a self-signed CA pair `<out_dir>/<name>{,-key}.pem`
    async fn init_ca(&self, csr: &Path, out_dir: &Path, name: &str) -> Result<()>;

    /// Create a pair signed by the CA named in the request
    async fn issue(&self, request: &IssueRequest) -> Result<()>;

    /// Create a bare RSA key pair `<out_dir>/<name>.key` and `<name>.pub`
    async fn generate_key_pair(&self, out_dir: &Path, name: &str) -> Result<()>;
}

/// Whether `<dir>/<name>.pem` and `<dir>/<name>-key.pem` both exist
pub fn pair_exists(dir: &Path, name: &str) -> bool {
    dir.join(format!("{name}.pem")).exists() && dir.join(format!("{name}-key.pem")).exists()
}

/// Whether `<dir>/<name>.key` and `<dir>/<name>.pub` both exist
pub fn key_pair_exists(dir: &Path, name: &str) -> bool {
    dir.join(format!("{name}.key")).exists() && dir.join(format!("{name}.pub")).exists()
}

/// Shells out to `cfssl gencert`, piping its JSON into `cfssljson -bare`
#[derive(Clone, Debug, Default)]
pub struct CfsslIssuer;

impl CfsslIssuer {
    async fn gencert(&self, args: Vec<String>, bare: &Path) -> Result<()> {
        let command = format!("cfssl {}", args.join(" "));
        let output = Command::new("cfssl")
            .args(&args)
            .output()
            .await
            .map_err(|e| Error::certificate(format!("failed to run cfssl: {e}")))?;
        if !output.status.success() {
            return Err(Error::certificate(format!(
                "{command}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut child = Command::new("cfssljson")
            .arg("-bare")
            .arg(bare)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::certificate(format!("failed to run cfssljson: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&output.stdout)
                .await
                .map_err(|e| Error::certificate(format!("failed to write to cfssljson: {e}")))?;
        }

        let result = child
            .wait_with_output()
            .await
            .map_err(|e| Error::certificate(format!("cfssljson failed: {e}")))?;
        if !result.status.success() {
            return Err(Error::certificate(format!(
                "cfssljson -bare {}: {}",
                bare.display(),
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CertificateIssuer for CfsslIssuer {
    async fn init_ca(&self, csr: &Path, out_dir: &Path, name: &str) -> Result<()> {
        let args = vec![
            "gencert".to_string(),
            "-initca".to_string(),
            csr.display().to_string(),
        ];
        self.gencert(args, &out_dir.join(name)).await?;
        info!(dir = %out_dir.display(), name = %name, "generated CA certificate");
        Ok(())
    }

    async fn issue(&self, request: &IssueRequest) -> Result<()> {
        let args = vec![
            "gencert".to_string(),
            format!("-ca={}", request.ca_cert.display()),
            format!("-ca-key={}", request.ca_key.display()),
            format!("-config={}", request.ca_config.display()),
            format!("-profile={}", request.profile),
            request.csr.display().to_string(),
        ];
        self.gencert(args, &request.out_dir.join(&request.name)).await?;
        info!(
            dir = %request.out_dir.display(),
            name = %request.name,
            profile = %request.profile,
            "generated certificate"
        );
        Ok(())
    }

    async fn generate_key_pair(&self, out_dir: &Path, name: &str) -> Result<()> {
        let rsa = Rsa::generate(SERVICE_ACCOUNT_KEY_BITS)
            .map_err(|e| Error::certificate(format!("failed to generate RSA key: {e}")))?;
        let private = rsa
            .private_key_to_pem()
            .map_err(|e| Error::certificate(format!("failed to encode private key: {e}")))?;
        let public = rsa
            .public_key_to_pem()
            .map_err(|e| Error::certificate(format!("failed to encode public key: {e}")))?;

        write_with_mode(&out_dir.join(format!("{name}.key")), &private, 0o600)?;
        write_with_mode(&out_dir.join(format!("{name}.pub")), &public, 0o644)?;
        info!(dir = %out_dir.display(), name = %name, "generated key pair");
        Ok(())
    }
}

fn write_with_mode(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .map_err(|e| Error::io(path, e))?;
    file.write_all(content).map_err(|e| Error::io(path, e))
}

/// A CA pair plus the cfssl config used to sign with it
struct Signer {
    cert: PathBuf,
    key: PathBuf,
    config: PathBuf,
}

impl Signer {
    fn new(ca_dir: &Path, ca_name: &str, config: PathBuf) -> Self {
        Self {
            cert: ca_dir.join(format!("{ca_name}.pem")),
            key: ca_dir.join(format!("{ca_name}-key.pem")),
            config,
        }
    }

    fn request(&self, name: &str, profile: &str, csr: PathBuf, out_dir: &Path) -> IssueRequest {
        IssueRequest {
            csr,
            ca_cert: self.cert.clone(),
            ca_key: self.key.clone(),
            ca_config: self.config.clone(),
            out_dir: out_dir.to_path_buf(),
            name: name.to_string(),
            profile: profile.to_string(),
        }
    }
}

/// Issue the request unless its pair already exists. Returns whether it issued.
async fn ensure_pair(issuer: &dyn CertificateIssuer, request: IssueRequest) -> Result<bool> {
    if pair_exists(&request.out_dir, &request.name) {
        debug!(name = %request.name, dir = %request.out_dir.display(), "certificate pair exists");
        return Ok(false);
    }
    issuer.issue(&request).await?;
    Ok(true)
}

async fn ensure_ca(
    issuer: &dyn CertificateIssuer,
    csr: &Path,
    out_dir: &Path,
    name: &str,
) -> Result<bool> {
    if pair_exists(out_dir, name) {
        debug!(name = %name, dir = %out_dir.display(), "CA pair exists");
        return Ok(false);
    }
    issuer.init_ca(csr, out_dir, name).await?;
    Ok(true)
}

/// Copy every file listed in `remote_dir` on `host` into `local_dir`
///
/// Returns the number of files fetched. A file that fails to transfer is
/// skipped with a warning.
pub async fn download_dir(
    transport: &dyn RemoteTransport,
    host: &str,
    remote_dir: &str,
    local_dir: &Path,
) -> Result<usize> {
    info!(node = %host, from = %remote_dir, to = %local_dir.display(), "downloading directory");
    let listing = transport
        .execute_command_with_output(host, &format!("ls {remote_dir}"))
        .await
        .map_err(|e| Error::transport(host, e))?;
    std::fs::create_dir_all(local_dir).map_err(|e| Error::io(local_dir, e))?;

    let remote_dir = remote_dir.trim_end_matches('/');
    let mut fetched = 0;
    for name in listing.lines().map(str::trim).filter(|n| !n.is_empty()) {
        let remote = format!("{remote_dir}/{name}");
        match transport
            .download_file(host, &remote, &local_dir.join(name))
            .await
        {
            Ok(()) => fetched += 1,
            Err(e) => warn!(node = %host, file = %remote, error = %e, "failed to download file"),
        }
    }
    Ok(fetched)
}

/// Pull the PKI installed on the fleet back into the output tree
///
/// The apiserver's `/etc/kubernetes/pki` lands in its output directory, each
/// etcd member's `/etc/ssl/etcd` lands there too, and every worker's kubelet
/// pair lands in its own directory. Unreachable hosts are logged and skipped,
/// so a new cluster simply gets fresh pairs. Returns the number of files
/// fetched.
pub async fn fetch_installed_pki(
    transport: &dyn RemoteTransport,
    apiserver: &Node,
    targets: &ClusterTopology,
    output_dir: &Path,
) -> Result<usize> {
    let api_dir = output_dir.join(&apiserver.hostname);
    let mut fetched = 0;

    match download_dir(transport, &apiserver.hostname, APISERVER_PKI_DIR, &api_dir).await {
        Ok(n) => fetched += n,
        Err(e) => warn!(node = %apiserver.hostname, error = %e, "no installed apiserver PKI"),
    }

    for node in kubelet_hosts(targets) {
        let node_dir = output_dir.join(&node.hostname);
        std::fs::create_dir_all(&node_dir).map_err(|e| Error::io(&node_dir, e))?;
        for file in ["kubelet.pem", "kubelet-key.pem"] {
            let remote = format!("{APISERVER_PKI_DIR}/{file}");
            match transport
                .download_file(&node.hostname, &remote, &node_dir.join(file))
                .await
            {
                Ok(()) => fetched += 1,
                Err(e) => warn!(node = %node.hostname, file = %remote, error = %e, "no installed kubelet certificate"),
            }
        }
    }

    for node in targets.nodes(Role::Etcd) {
        match download_dir(transport, &node.hostname, ETCD_PKI_DIR, &api_dir).await {
            Ok(n) => fetched += n,
            Err(e) => warn!(node = %node.hostname, error = %e, "no installed etcd PKI"),
        }
    }

    info!(fetched, "installed PKI fetched");
    Ok(fetched)
}

fn kubelet_hosts(targets: &ClusterTopology) -> impl Iterator<Item = &Node> {
    targets
        .nodes(Role::Worker)
        .iter()
        .chain(targets.nodes(Role::Prometheus))
}

/// Make sure the apiserver and every node of `targets` have their key pairs
///
/// CSR definitions are read from the rendered output: `ca-csr.json` in the
/// output root, the others in each node's directory. The apiserver set is
/// always ensured, kubelet and etcd pairs only for `targets`. Returns the
/// number of pairs created.
pub async fn ensure_certificates(
    issuer: &dyn CertificateIssuer,
    apiserver: &Node,
    targets: &ClusterTopology,
    output_dir: &Path,
) -> Result<usize> {
    let api_dir = output_dir.join(&apiserver.hostname);
    let mut issued = ensure_apiserver_certificates(issuer, &api_dir, output_dir).await?;

    let cluster_ca = Signer::new(&api_dir, "ca", api_dir.join("ca-config.json"));
    for node in kubelet_hosts(targets) {
        let node_dir = output_dir.join(&node.hostname);
        let request = cluster_ca.request(
            "kubelet",
            "client",
            node_dir.join("kubelet-csr.json"),
            &node_dir,
        );
        if ensure_pair(issuer, request).await? {
            issued += 1;
        }
    }

    for node in targets.nodes(Role::Etcd) {
        let node_dir = output_dir.join(&node.hostname);
        let csr = node_dir.join("etcd-csr.json");
        let signer = Signer::new(&api_dir, "ca", node_dir.join("ca-config.json"));
        let peer = format!("peer-{}", node.short_name());
        for (name, profile) in [
            (peer.as_str(), "peer"),
            ("server", "server"),
            ("etcd-client", "client"),
        ] {
            let request = signer.request(name, profile, csr.clone(), &api_dir);
            if ensure_pair(issuer, request).await? {
                issued += 1;
            }
        }
    }

    info!(issued, "certificates ensured");
    Ok(issued)
}

async fn ensure_apiserver_certificates(
    issuer: &dyn CertificateIssuer,
    api_dir: &Path,
    output_dir: &Path,
) -> Result<usize> {
    let mut issued = 0;

    if ensure_ca(issuer, &output_dir.join("ca-csr.json"), api_dir, "ca").await? {
        issued += 1;
    }

    if key_pair_exists(api_dir, SERVICE_ACCOUNT_KEY) {
        debug!(dir = %api_dir.display(), "service account key pair exists");
    } else {
        issuer
            .generate_key_pair(api_dir, SERVICE_ACCOUNT_KEY)
            .await?;
        issued += 1;
    }

    if ensure_ca(
        issuer,
        &api_dir.join("front-proxy-ca-csr.json"),
        api_dir,
        "front-proxy-ca",
    )
    .await?
    {
        issued += 1;
    }

    let config = api_dir.join("ca-config.json");
    let front_proxy = Signer::new(api_dir, "front-proxy-ca", config.clone());
    let cluster_ca = Signer::new(api_dir, "ca", config);
    let csr = |name: &str| api_dir.join(format!("{name}-csr.json"));

    let requests = [
        front_proxy.request(
            "front-proxy-client",
            "client",
            csr("front-proxy-client"),
            api_dir,
        ),
        cluster_ca.request("kubelet", "client", csr("kubelet"), api_dir),
        cluster_ca.request("admin", "client", csr("admin"), api_dir),
        cluster_ca.request("kube-proxy", "client", csr("kube-proxy"), api_dir),
        cluster_ca.request(
            "kube-apiserver-server",
            "server",
            csr("kube-apiserver-server"),
            api_dir,
        ),
    ];
    for request in requests {
        if ensure_pair(issuer, request).await? {
            issued += 1;
        }
    }
    Ok(issued)
}
