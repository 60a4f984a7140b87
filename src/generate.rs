//! Rendering per-node boot configuration from templates
//!
//! Layout read by the generator:
//!
//! ```text
//! templates/*.json          shared files, rendered once into <output>/
//! templates/<role>/**       rendered per node into <output>/<hostname>/
//! vars/<cluster>.yaml       cluster variables
//! vars/admins.yaml          admin user name to SSH public key
//! ```
//!
//! Role templates are flattened by file name. Prometheus nodes use the
//! worker templates. Referencing an undefined variable fails the render.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use minijinja::{Environment, UndefinedBehavior, Value};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::pki::{ensure_certificates, fetch_installed_pki, CertificateIssuer};
use crate::resolve::{Resolver, SystemResolver};
use crate::topology::{ClusterTopology, Node, Role};
use crate::transport::RemoteTransport;
use crate::{Error, Result};

/// Default template directory
pub const DEFAULT_TEMPLATES_DIR: &str = "templates";

/// Default cluster variables directory
pub const DEFAULT_VARS_DIR: &str = "vars";

/// Default identity file handed to templates
pub const DEFAULT_IDENTITY_FILE: &str = "./id_deployer_rsa";

/// Admin users file inside the vars directory
pub const ADMINS_FILE: &str = "admins.yaml";

const ETCD_CLIENT_PORT: u16 = 2379;
const ETCD_PEER_PORT: u16 = 2380;

/// Separator for lists spliced into a quoted JSON array in templates
const QUOTED_LIST_SEPARATOR: &str = "\",\n\"";

/// What a generation pass produced
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GenerationReport {
    /// Files rendered, shared and per node
    pub rendered: usize,
    /// Installed PKI files fetched back from the fleet
    pub fetched: usize,
    /// Certificate pairs created
    pub certificates: usize,
}

/// Renders templates for every node of a cluster and ensures its certificates
pub struct ConfigGenerator {
    issuer: Arc<dyn CertificateIssuer>,
    transport: Arc<dyn RemoteTransport>,
    resolver: Arc<dyn Resolver>,
    output_dir: PathBuf,
    templates_dir: PathBuf,
    vars_dir: PathBuf,
    identity_file: String,
    hosts: Vec<String>,
}

impl ConfigGenerator {
    /// Create a generator writing into `output_dir`
    ///
    /// `transport` is used to fetch the PKI already installed on the fleet.
    pub fn new(
        issuer: Arc<dyn CertificateIssuer>,
        transport: Arc<dyn RemoteTransport>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            issuer,
            transport,
            resolver: Arc::new(SystemResolver),
            output_dir: output_dir.into(),
            templates_dir: PathBuf::from(DEFAULT_TEMPLATES_DIR),
            vars_dir: PathBuf::from(DEFAULT_VARS_DIR),
            identity_file: DEFAULT_IDENTITY_FILE.to_string(),
            hosts: Vec::new(),
        }
    }

    /// Read templates from `dir`
    pub fn with_templates_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.templates_dir = dir.into();
        self
    }

    /// Read cluster variables from `dir`
    pub fn with_vars_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.vars_dir = dir.into();
        self
    }

    /// Identity file exposed to templates as `identity_file`
    pub fn with_identity_file(mut self, identity_file: impl Into<String>) -> Self {
        self.identity_file = identity_file.into();
        self
    }

    /// Resolve node addresses with `resolver`
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Limit certificate work to these hosts; empty means every node
    pub fn with_hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }

    /// Wipe the output directory and render everything for `cluster`
    ///
    /// Templates are rendered for every node. Installed PKI is fetched and
    /// missing pairs issued for the apiserver plus the selected hosts.
    pub async fn generate(
        &self,
        cluster: &str,
        topology: &ClusterTopology,
    ) -> Result<GenerationReport> {
        topology.validate()?;
        let apiserver = topology
            .apiserver()
            .ok_or_else(|| Error::topology("cluster has no apiserver node"))?;
        let targets = if self.hosts.is_empty() {
            topology.clone()
        } else {
            topology.filter_hosts(&self.hosts)?
        };

        let vars = self.load_vars(cluster)?;
        let admins: BTreeMap<String, String> = read_yaml(&self.vars_dir.join(ADMINS_FILE))?;
        let addresses = self.resolve_all(topology).await?;
        let cluster_vars = cluster_variables(
            vars,
            &users_block(&admins),
            cluster,
            &self.identity_file,
            topology,
            &addresses,
        )?;

        reset_dir(&self.output_dir)?;

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        let mut rendered = 0;
        for template in shared_templates(&self.templates_dir)? {
            rendered += render_into(&env, &template, &self.output_dir, &cluster_vars)?;
        }

        for node in topology.iter() {
            let node_dir = self.output_dir.join(&node.hostname);
            std::fs::create_dir_all(&node_dir).map_err(|e| Error::io(&node_dir, e))?;

            let role_dir = self.templates_dir.join(template_role(node.role).as_str());
            let templates = role_templates(&role_dir)?;
            let vars = node_variables(&cluster_vars, node, &addresses);
            for template in &templates {
                rendered += render_into(&env, template, &node_dir, &vars)?;
            }
            debug!(node = %node.hostname, files = templates.len(), "rendered node templates");
        }

        let fetched =
            fetch_installed_pki(self.transport.as_ref(), apiserver, &targets, &self.output_dir)
                .await?;
        let certificates =
            ensure_certificates(self.issuer.as_ref(), apiserver, &targets, &self.output_dir)
                .await?;

        info!(
            cluster = %cluster,
            nodes = topology.len(),
            rendered,
            fetched,
            certificates,
            output = %self.output_dir.display(),
            "configuration generated"
        );
        Ok(GenerationReport {
            rendered,
            fetched,
            certificates,
        })
    }

    fn load_vars(&self, cluster: &str) -> Result<BTreeMap<String, JsonValue>> {
        read_yaml(&self.vars_dir.join(format!("{cluster}.yaml")))
    }

    async fn resolve_all(&self, topology: &ClusterTopology) -> Result<BTreeMap<String, IpAddr>> {
        let mut addresses = BTreeMap::new();
        for node in topology.iter() {
            let ip = self.resolver.resolve(&node.hostname).await?;
            addresses.insert(node.hostname.clone(), ip);
        }
        info!(hosts = addresses.len(), "resolved node addresses");
        Ok(addresses)
    }
}

/// Parse a YAML mapping; an empty file is an empty map
fn read_yaml<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let parsed: Option<T> = serde_yaml::from_str(&content)
        .map_err(|e| Error::serialization(format!("{}: {e}", path.display())))?;
    Ok(parsed.unwrap_or_default())
}

/// Cloud-config `users` entries, one per admin, sorted by name
pub fn users_block(admins: &BTreeMap<String, String>) -> String {
    let mut block = String::new();
    for (name, key) in admins {
        let _ = write!(
            block,
            "    - name: {name}\n      groups: [sudo]\n      ssh_authorized_keys:\n      - \"{key}\"\n"
        );
    }
    block
}

/// Prometheus nodes are configured like workers
fn template_role(role: Role) -> Role {
    match role {
        Role::Prometheus => Role::Worker,
        other => other,
    }
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    }
    std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))
}

/// Cluster-wide variables: the YAML vars overlaid with runtime values
fn cluster_variables(
    mut vars: BTreeMap<String, JsonValue>,
    users: &str,
    cluster: &str,
    identity_file: &str,
    topology: &ClusterTopology,
    addresses: &BTreeMap<String, IpAddr>,
) -> Result<BTreeMap<String, JsonValue>> {
    let apiserver = topology
        .apiserver()
        .ok_or_else(|| Error::topology("cluster has no apiserver node"))?;
    let ip_of = |node: &Node| -> Result<String> {
        addresses
            .get(&node.hostname)
            .map(IpAddr::to_string)
            .ok_or_else(|| Error::resolution(&node.hostname, "address not resolved"))
    };

    let etcd = topology.nodes(Role::Etcd);
    let etcd_ips = etcd.iter().map(ip_of).collect::<Result<Vec<_>>>()?;
    let etcd_hostnames: Vec<&str> = etcd.iter().map(|n| n.hostname.as_str()).collect();
    let etcd_urls = etcd
        .iter()
        .map(|n| format!("https://{}:{ETCD_CLIENT_PORT}", n.hostname))
        .collect::<Vec<_>>()
        .join(",");
    let etcd_initial_cluster = etcd
        .iter()
        .zip(&etcd_ips)
        .map(|(n, ip)| format!("{}=https://{ip}:{ETCD_PEER_PORT}", n.short_name()))
        .collect::<Vec<_>>()
        .join(",");
    let worker_ips = topology
        .nodes(Role::Worker)
        .iter()
        .chain(topology.nodes(Role::Prometheus))
        .map(ip_of)
        .collect::<Result<Vec<_>>>()?;

    vars.insert("users".into(), users.into());
    vars.insert("cluster_name".into(), cluster.into());
    vars.insert("identity_file".into(), identity_file.into());
    vars.insert("apiserver".into(), apiserver.hostname.clone().into());
    vars.insert("apiserver_ip".into(), ip_of(apiserver)?.into());
    vars.insert("worker_ips".into(), worker_ips.join(",").into());
    vars.insert(
        "etcd_hostnames".into(),
        etcd_hostnames.join(QUOTED_LIST_SEPARATOR).into(),
    );
    vars.insert("etcd_ips".into(), etcd_ips.join(QUOTED_LIST_SEPARATOR).into());
    vars.insert("etcd_ips_no_proxy".into(), etcd_ips.join(",").into());
    vars.insert("etcd_urls".into(), etcd_urls.into());
    vars.insert("etcd_initial_cluster".into(), etcd_initial_cluster.into());
    Ok(vars)
}

fn node_variables(
    cluster_vars: &BTreeMap<String, JsonValue>,
    node: &Node,
    addresses: &BTreeMap<String, IpAddr>,
) -> BTreeMap<String, JsonValue> {
    let mut vars = cluster_vars.clone();
    vars.insert("hostname".into(), node.hostname.clone().into());
    vars.insert("hostname_short".into(), node.short_name().into());
    vars.insert(
        "hostname_ip".into(),
        addresses
            .get(&node.hostname)
            .map_or(JsonValue::Null, |ip| ip.to_string().into()),
    );
    vars.insert("role".into(), node.role.as_str().into());
    vars.insert(
        "location".into(),
        node.location.clone().map_or(JsonValue::Null, JsonValue::from),
    );
    vars
}

/// Regular files directly under `dir`, sorted
fn shared_templates(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Every regular file below `dir`, sorted, rejecting duplicate file names
fn role_templates(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::template(format!(
            "template directory {} does not exist",
            dir.display()
        )));
    }
    let mut files = Vec::new();
    collect_files(dir, &mut files)?;
    files.sort();

    let mut seen = BTreeMap::new();
    for file in &files {
        if let Some(previous) = seen.insert(file.file_name(), file) {
            return Err(Error::template(format!(
                "{} and {} flatten to the same output file",
                previous.display(),
                file.display()
            )));
        }
    }
    Ok(files)
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else if path.is_file() {
            files.push(path);
        }
    }
    Ok(())
}

/// Render `template` into `out_dir` under its file name
fn render_into(
    env: &Environment<'_>,
    template: &Path,
    out_dir: &Path,
    vars: &BTreeMap<String, JsonValue>,
) -> Result<usize> {
    let source = std::fs::read_to_string(template).map_err(|e| Error::io(template, e))?;
    let rendered = env
        .render_str(&source, Value::from_serialize(vars))
        .map_err(|e| Error::template(format!("{}: {e:#}", template.display())))?;

    let Some(name) = template.file_name() else {
        return Ok(0);
    };
    let target = out_dir.join(name);
    std::fs::write(&target, rendered).map_err(|e| Error::io(&target, e))?;
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{IssueRequest, MockCertificateIssuer};
    use crate::resolve::MockResolver;
    use crate::transport::{MockRemoteTransport, TransportError};
    use std::sync::Mutex;

    struct Fixture {
        _root: tempfile::TempDir,
        templates: PathBuf,
        vars: PathBuf,
        output: PathBuf,
    }

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let templates = root.path().join("templates");
        let vars = root.path().join("vars");
        let output = root.path().join("output");

        write(
            &templates.join("ca-csr.json"),
            r#"{"CN": "{{ cluster_name }}"}"#,
        );
        write(
            &templates.join("etcd/config.ign"),
            r#"{"name": "{{ hostname_short }}", "cluster": "{{ etcd_initial_cluster }}"}"#,
        );
        write(
            &templates.join("apiserver/config.ign"),
            r#"{"etcd": "{{ etcd_urls }}", "dns": "{{ dns_server }}"}"#,
        );
        write(
            &templates.join("worker/config.ign"),
            r#"{"host": "{{ hostname }}", "role": "{{ role }}", "apiserver": "{{ apiserver }}"}"#,
        );
        write(
            &templates.join("worker/csr/kubelet-csr.json"),
            r#"{"CN": "system:node:{{ hostname }}"}"#,
        );
        write(&vars.join("lab.yaml"), "dns_server: 10.0.0.2\n");
        write(
            &vars.join("admins.yaml"),
            "zoe: ssh-ed25519 AAAAzoe\nada: ssh-ed25519 AAAAada\n",
        );

        Fixture {
            _root: root,
            templates,
            vars,
            output,
        }
    }

    fn topology() -> ClusterTopology {
        ClusterTopology::from_yaml_str(
            r#"
etcd:
  - hostname: etcd-0.lab
  - hostname: etcd-1.lab
apiserver:
  - hostname: api-0.lab
worker:
  - hostname: worker-0.lab
prometheus:
  - hostname: prom-0.lab
"#,
        )
        .unwrap()
    }

    fn resolver() -> Arc<dyn Resolver> {
        let mut resolver = MockResolver::new();
        resolver.expect_resolve().returning(|host| {
            let last = match host {
                "etcd-0.lab" => 10,
                "etcd-1.lab" => 11,
                "api-0.lab" => 20,
                "worker-0.lab" => 30,
                "prom-0.lab" => 40,
                other => return Err(Error::resolution(other, "unknown host")),
            };
            Ok(IpAddr::from([10, 0, 0, last]))
        });
        Arc::new(resolver)
    }

    /// A fleet where nothing is installed yet
    fn offline_transport() -> MockRemoteTransport {
        let mut transport = MockRemoteTransport::new();
        transport
            .expect_execute_command_with_output()
            .returning(|_, cmd| {
                Err(TransportError::CommandFailed {
                    command: cmd.to_string(),
                    status: Some(2),
                    output: "No such file or directory".to_string(),
                })
            });
        transport.expect_download_file().returning(|_, remote, local| {
            Err(TransportError::Transfer {
                from: remote.to_string(),
                to: local.display().to_string(),
                message: "No such file or directory".to_string(),
            })
        });
        transport
    }

    fn issuer() -> Arc<dyn CertificateIssuer> {
        let mut issuer = MockCertificateIssuer::new();
        issuer.expect_init_ca().returning(|_, _, _| Ok(()));
        issuer.expect_generate_key_pair().returning(|_, _| Ok(()));
        issuer.expect_issue().returning(|_| Ok(()));
        Arc::new(issuer)
    }

    fn generator_with(
        fx: &Fixture,
        issuer: Arc<dyn CertificateIssuer>,
        transport: MockRemoteTransport,
    ) -> ConfigGenerator {
        ConfigGenerator::new(issuer, Arc::new(transport), &fx.output)
            .with_templates_dir(&fx.templates)
            .with_vars_dir(&fx.vars)
            .with_resolver(resolver())
    }

    fn generator(fx: &Fixture) -> ConfigGenerator {
        generator_with(fx, issuer(), offline_transport())
    }

    fn read(path: PathBuf) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[tokio::test]
    async fn test_renders_shared_and_role_templates() {
        let fx = fixture();
        let report = generator(&fx).generate("lab", &topology()).await.unwrap();

        // ca-csr + 2 etcd + 1 apiserver + 2 files for each of worker and prometheus
        assert_eq!(report.rendered, 8);
        assert_eq!(report.fetched, 0);
        // 2 CAs, sa, 5 apiserver pairs, 2 kubelets, 3 pairs per etcd member
        assert_eq!(report.certificates, 16);

        assert_eq!(read(fx.output.join("ca-csr.json")), r#"{"CN": "lab"}"#);
        assert_eq!(
            read(fx.output.join("etcd-1.lab/config.ign")),
            r#"{"name": "etcd-1", "cluster": "etcd-0=https://10.0.0.10:2380,etcd-1=https://10.0.0.11:2380"}"#
        );
        assert_eq!(
            read(fx.output.join("api-0.lab/config.ign")),
            r#"{"etcd": "https://etcd-0.lab:2379,https://etcd-1.lab:2379", "dns": "10.0.0.2"}"#
        );
    }

    #[tokio::test]
    async fn test_runtime_variables_are_exposed() {
        let fx = fixture();
        write(
            &fx.templates.join("apiserver/runtime.txt"),
            "apiserver={{ apiserver }} {{ apiserver_ip }}\n\
             self={{ hostname_ip }}\n\
             workers={{ worker_ips }}\n\
             etcd=[\"{{ etcd_hostnames }}\"]\n\
             etcd_ips=[\"{{ etcd_ips }}\"]\n\
             no_proxy={{ etcd_ips_no_proxy }}\n\
             identity={{ identity_file }}\n\
             users:\n{{ users }}",
        );

        generator(&fx)
            .with_identity_file("/keys/deployer")
            .generate("lab", &topology())
            .await
            .unwrap();

        let expected = "apiserver=api-0.lab 10.0.0.20\n\
                        self=10.0.0.20\n\
                        workers=10.0.0.30,10.0.0.40\n\
                        etcd=[\"etcd-0.lab\",\n\"etcd-1.lab\"]\n\
                        etcd_ips=[\"10.0.0.10\",\n\"10.0.0.11\"]\n\
                        no_proxy=10.0.0.10,10.0.0.11\n\
                        identity=/keys/deployer\n\
                        users:\n    \
                        - name: ada\n      groups: [sudo]\n      ssh_authorized_keys:\n      - \"ssh-ed25519 AAAAada\"\n    \
                        - name: zoe\n      groups: [sudo]\n      ssh_authorized_keys:\n      - \"ssh-ed25519 AAAAzoe\"\n";
        assert_eq!(read(fx.output.join("api-0.lab/runtime.txt")), expected);
    }

    #[test]
    fn test_users_block_sorted_by_name() {
        let admins = BTreeMap::from([
            ("zoe".to_string(), "key-z".to_string()),
            ("ada".to_string(), "key-a".to_string()),
        ]);
        let block = users_block(&admins);
        assert!(block.starts_with("    - name: ada\n"));
        assert_eq!(block.matches("groups: [sudo]").count(), 2);
        assert!(block.ends_with("      - \"key-z\"\n"));
    }

    #[tokio::test]
    async fn test_prometheus_uses_worker_templates_flattened() {
        let fx = fixture();
        generator(&fx).generate("lab", &topology()).await.unwrap();

        assert_eq!(
            read(fx.output.join("prom-0.lab/config.ign")),
            r#"{"host": "prom-0.lab", "role": "prometheus", "apiserver": "api-0.lab"}"#
        );
        assert_eq!(
            read(fx.output.join("prom-0.lab/kubelet-csr.json")),
            r#"{"CN": "system:node:prom-0.lab"}"#
        );
        assert!(!fx.output.join("prom-0.lab/csr").exists());
    }

    #[tokio::test]
    async fn test_output_is_wiped_before_rendering() {
        let fx = fixture();
        write(&fx.output.join("stale-host/config.ign"), "{}");

        generator(&fx).generate("lab", &topology()).await.unwrap();
        assert!(!fx.output.join("stale-host").exists());
    }

    /// Story: regenerating against a live cluster keeps its CA
    ///
    /// The output tree is wiped on every run, so the CA installed on the
    /// apiserver has to come back from the host before issuance. Minting a
    /// new one would leave every installed certificate signed by a CA the
    /// regenerated configuration no longer trusts.
    #[tokio::test]
    async fn story_installed_ca_is_reused_across_runs() {
        let fx = fixture();
        // a CA left over from a previous run is wiped with the rest
        write(&fx.output.join("api-0.lab/ca.pem"), "stale");

        let mut transport = MockRemoteTransport::new();
        transport
            .expect_execute_command_with_output()
            .returning(|host, cmd| match (host, cmd) {
                ("api-0.lab", "ls /etc/kubernetes/pki") => Ok("ca.pem\nca-key.pem\n".to_string()),
                _ => Err(TransportError::ConnectionDropped),
            });
        transport.expect_download_file().returning(|host, remote, local| {
            if host == "api-0.lab" && remote.starts_with("/etc/kubernetes/pki/ca") {
                std::fs::write(local, "installed").unwrap();
                Ok(())
            } else {
                Err(TransportError::ConnectionDropped)
            }
        });

        let cas = Arc::new(Mutex::new(Vec::new()));
        let sink = cas.clone();
        let mut issuer = MockCertificateIssuer::new();
        issuer.expect_init_ca().returning(move |_, _, name| {
            sink.lock().unwrap().push(name.to_string());
            Ok(())
        });
        issuer.expect_generate_key_pair().returning(|_, _| Ok(()));
        issuer.expect_issue().returning(|_| Ok(()));

        let report = generator_with(&fx, Arc::new(issuer), transport)
            .generate("lab", &topology())
            .await
            .unwrap();

        assert_eq!(report.fetched, 2);
        assert_eq!(*cas.lock().unwrap(), vec!["front-proxy-ca"]);
        assert_eq!(read(fx.output.join("api-0.lab/ca.pem")), "installed");
    }

    #[tokio::test]
    async fn test_hosts_limit_certificate_work() {
        let fx = fixture();
        let issued = Arc::new(Mutex::new(Vec::<IssueRequest>::new()));
        let sink = issued.clone();
        let mut issuer = MockCertificateIssuer::new();
        issuer.expect_init_ca().returning(|_, _, _| Ok(()));
        issuer.expect_generate_key_pair().returning(|_, _| Ok(()));
        issuer.expect_issue().returning(move |request| {
            sink.lock().unwrap().push(request.clone());
            Ok(())
        });

        let report = generator_with(&fx, Arc::new(issuer), offline_transport())
            .with_hosts(vec!["worker-0.lab".to_string()])
            .generate("lab", &topology())
            .await
            .unwrap();

        // every node is still rendered
        assert_eq!(report.rendered, 8);
        let node_dirs: Vec<PathBuf> = issued
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.out_dir.clone())
            .filter(|d| !d.ends_with("api-0.lab"))
            .collect();
        assert_eq!(node_dirs, vec![fx.output.join("worker-0.lab")]);
    }

    #[tokio::test]
    async fn test_unknown_host_fails_before_wiping() {
        let fx = fixture();
        write(&fx.output.join("keep/config.ign"), "{}");

        let err = generator(&fx)
            .with_hosts(vec!["ghost.lab".to_string()])
            .generate("lab", &topology())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Topology(_)));
        assert!(fx.output.join("keep/config.ign").exists());
    }

    #[tokio::test]
    async fn test_unresolvable_host_fails() {
        let fx = fixture();
        let mut topology = topology();
        topology.push(Node::new("ghost.lab", Role::Worker));

        let err = generator(&fx)
            .generate("lab", &topology)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Resolution { ref host, .. } if host == "ghost.lab"));
    }

    #[tokio::test]
    async fn test_undefined_variable_fails() {
        let fx = fixture();
        write(&fx.templates.join("etcd/units.yaml"), "{{ missing_var }}");

        let err = generator(&fx)
            .generate("lab", &topology())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Template(ref msg) if msg.contains("units.yaml")));
    }

    #[tokio::test]
    async fn test_missing_vars_file_fails() {
        let fx = fixture();
        let err = generator(&fx)
            .generate("other", &topology())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[tokio::test]
    async fn test_missing_admins_file_fails() {
        let fx = fixture();
        std::fs::remove_file(fx.vars.join(ADMINS_FILE)).unwrap();
        let err = generator(&fx)
            .generate("lab", &topology())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io { ref path, .. } if path.ends_with("admins.yaml")));
    }

    #[test]
    fn test_duplicate_flattened_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a/config.ign"), "{}");
        write(&dir.path().join("b/config.ign"), "{}");
        assert!(matches!(
            role_templates(dir.path()),
            Err(Error::Template(_))
        ));
    }
}
