//! The closed algebraic description of resolved test definitions.
//!
//! These are the types the resolver produces and the object graph stores:
//! images, repo references, test dependencies, environments, stages, and
//! fully resolved test definitions. Parsing from the on-disk definition
//! file format lives in `gantry-core`; everything here is already shaped
//! and validated.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Hardware / OS
// ---------------------------------------------------------------------------

/// Hardware shape of a machine or a machine category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HardwareConfig {
    pub cores: u32,
    pub ram_gb: u32,
}

/// OS configuration of a machine: the unit of provisioning together with
/// the hardware shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OsConfig {
    LinuxWithDocker,
    WindowsWithDocker,
    /// Bare linux machine booted from an image; no container layer.
    LinuxOneshot { ami: String },
    /// Bare windows machine booted from an image; no container layer.
    WindowsOneshot { ami: String },
}

impl OsConfig {
    pub fn uses_docker(&self) -> bool {
        matches!(self, OsConfig::LinuxWithDocker | OsConfig::WindowsWithDocker)
    }
}

impl fmt::Display for OsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsConfig::LinuxWithDocker => write!(f, "linux-docker"),
            OsConfig::WindowsWithDocker => write!(f, "windows-docker"),
            OsConfig::LinuxOneshot { ami } => write!(f, "linux-oneshot/{ami}"),
            OsConfig::WindowsOneshot { ami } => write!(f, "windows-oneshot/{ami}"),
        }
    }
}

/// Platform declared by an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Linux,
    Windows,
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// Execution image for an environment.
///
/// `Dockerfile` points at a file in some repo/commit; the resolver inlines
/// its contents as `DockerfileInline` so the resolved definition is
/// self-contained (and so the test hash covers the dockerfile text).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Image {
    Dockerfile {
        repo: String,
        commit_hash: String,
        path: String,
    },
    DockerfileInline {
        contents: String,
    },
    Ami {
        base_ami: String,
    },
}

// ---------------------------------------------------------------------------
// Repo references
// ---------------------------------------------------------------------------

/// A named reference to another repository within a definitions file.
///
/// After resolution, only `Pin`, `Reference`, and `ImportedReference`
/// remain; `Import` is a parse-time symbolic path through other refs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepoReference {
    /// Pinned to a hash but tracking a branch so pin updates can be
    /// automated.
    Pin {
        /// `"reponame/40hexhash"` (or `"reponame/HEAD"` as a sentinel).
        reference: String,
        branch: String,
        #[serde(default)]
        auto: bool,
        #[serde(default)]
        prioritize: bool,
    },
    /// A bare `"reponame/hash"` reference.
    Reference { reference: String },
    /// A reference produced by following an `Import` chain.
    ImportedReference {
        reference: String,
        import_source: String,
        orig_reference: String,
    },
    /// Symbolic path through other refs, e.g. `"base/sub_repo"`.
    Import { import: String },
}

impl RepoReference {
    pub fn is_pin(&self) -> bool {
        matches!(self, RepoReference::Pin { .. })
    }

    pub fn is_import(&self) -> bool {
        matches!(self, RepoReference::Import { .. })
    }

    /// The full `"reponame/hash"` string, `None` for imports.
    pub fn reference_str(&self) -> Option<&str> {
        match self {
            RepoReference::Pin { reference, .. }
            | RepoReference::Reference { reference }
            | RepoReference::ImportedReference { reference, .. } => Some(reference),
            RepoReference::Import { .. } => None,
        }
    }

    /// The repo name portion of the reference.
    pub fn reponame(&self) -> &str {
        let r = self.reference_str().expect("reponame() called on an Import");
        match r.rfind('/') {
            Some(pos) => &r[..pos],
            None => r,
        }
    }

    /// The commit hash portion of the reference (may be `"HEAD"`).
    pub fn commit_hash(&self) -> &str {
        let r = self
            .reference_str()
            .expect("commit_hash() called on an Import");
        match r.rfind('/') {
            Some(pos) => &r[pos + 1..],
            None => "",
        }
    }
}

/// Reference to an environment defined in some repo/commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EnvironmentReference {
    pub repo: String,
    pub commit_hash: String,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Test dependencies
// ---------------------------------------------------------------------------

/// A declared input of a test or environment.
///
/// Parse-time variants (`InternalBuild`, `ExternalBuild`,
/// `UnresolvedExternalBuild`, `UnresolvedSource`) are rewritten by the
/// resolver into `Build` and `Source` only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestDependency {
    /// A build (possibly `"build/artifact"`) defined in the same commit.
    InternalBuild { name: String },
    /// A build in a specific other repo/commit.
    ExternalBuild {
        repo: String,
        commit_hash: String,
        name: String,
    },
    /// A build in a repo named by a repo reference (hash not yet known).
    UnresolvedExternalBuild { repo_name: String, name: String },
    /// Source of a repo named by a repo reference.
    UnresolvedSource {
        repo_name: String,
        path: Option<String>,
    },
    /// Source tree of a specific repo/commit (optionally a subpath; the
    /// resolver substitutes the most recent commit touching the subpath).
    Source {
        repo: String,
        commit_hash: String,
        path: Option<String>,
    },
    /// Fully resolved build dependency, addressed by test hash.
    Build {
        build_hash: String,
        name: String,
        artifact: String,
    },
}

impl TestDependency {
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            TestDependency::Build { .. } | TestDependency::Source { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Stages and artifacts
// ---------------------------------------------------------------------------

/// A named output directory of a stage, tarballed and uploaded on success.
/// The empty name denotes the whole build output directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactDef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub directory: String,
}

/// One ordered execution phase of a test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stage {
    pub command: String,
    #[serde(default)]
    pub cleanup: String,
    #[serde(default)]
    pub artifacts: Vec<ArtifactDef>,
    #[serde(default)]
    pub order: i64,
}

// ---------------------------------------------------------------------------
// Environments
// ---------------------------------------------------------------------------

/// A fully merged, substituted execution environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEnvironment {
    pub platform: Platform,
    pub image: Image,
    pub variables: BTreeMap<String, String>,
    pub dependencies: BTreeMap<String, TestDependency>,
    pub setup_script_contents: String,
    pub test_configuration: String,
    pub test_stages: Vec<Stage>,
    pub test_timeout: u64,
    pub test_min_cores: u32,
    pub test_max_cores: u32,
    pub test_min_ram_gb: u32,
    pub test_min_disk_gb: u32,
    pub test_max_retries: u32,
    pub test_retry_wait_seconds: u64,
}

impl ResolvedEnvironment {
    /// Machine provisioning target implied by this environment.
    pub fn machine_os(&self) -> OsConfig {
        match (&self.platform, &self.image) {
            (Platform::Linux, Image::Ami { base_ami }) => OsConfig::LinuxOneshot {
                ami: base_ami.clone(),
            },
            (Platform::Windows, Image::Ami { base_ami }) => OsConfig::WindowsOneshot {
                ami: base_ami.clone(),
            },
            (Platform::Linux, _) => OsConfig::LinuxWithDocker,
            (Platform::Windows, _) => OsConfig::WindowsWithDocker,
        }
    }
}

// ---------------------------------------------------------------------------
// Test definitions
// ---------------------------------------------------------------------------

/// What a test is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    Build,
    Test,
    Deployment,
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Build => "build",
            Self::Test => "test",
            Self::Deployment => "deployment",
        };
        f.write_str(s)
    }
}

impl FromStr for TestKind {
    type Err = TestKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build" => Ok(Self::Build),
            "test" => Ok(Self::Test),
            "deployment" => Ok(Self::Deployment),
            other => Err(TestKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TestKind`] string.
#[derive(Debug, Clone)]
pub struct TestKindParseError(pub String);

impl fmt::Display for TestKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid test kind: {:?}", self.0)
    }
}

impl std::error::Error for TestKindParseError {}

/// A fully resolved test definition.
///
/// Two tests with identical resolved definitions hash identically and are
/// deduplicated into one [`crate::models::Test`] entity, whatever commit
/// or repo they came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDefinition {
    pub name: String,
    pub kind: TestKind,
    pub environment_name: String,
    pub environment_mixins: Vec<String>,
    pub environment: ResolvedEnvironment,
    pub dependencies: BTreeMap<String, TestDependency>,
    pub variables: BTreeMap<String, String>,
    pub stages: Vec<Stage>,
    pub configuration: String,
    pub project: String,
    pub disabled: bool,
    pub timeout: u64,
    pub min_cores: u32,
    pub max_cores: u32,
    pub min_ram_gb: u32,
    pub min_disk_gb: u32,
    pub max_retries: u32,
    pub retry_wait_seconds: u64,
    /// Content hash of the resolved definition; empty until assigned.
    #[serde(default)]
    pub hash: String,
}

impl TestDefinition {
    /// Content hash over the resolved definition with the hash field
    /// cleared. Serialization is canonical (BTreeMap field order, stable
    /// serde layout), so identical definitions hash identically.
    pub fn content_hash(&self) -> String {
        let mut unhashed = self.clone();
        unhashed.hash = String::new();
        let bytes = serde_json::to_vec(&unhashed).expect("test definition serializes");
        hex::encode(Sha256::digest(&bytes))
    }

    /// All artifact names declared across stages, in stage order.
    pub fn artifact_names(&self) -> Vec<String> {
        self.stages
            .iter()
            .flat_map(|s| s.artifacts.iter().map(|a| a.name.clone()))
            .collect()
    }

    pub fn summary(&self) -> TestDefinitionSummary {
        TestDefinitionSummary {
            name: self.name.clone(),
            machine_os: self.environment.machine_os(),
            kind: self.kind,
            configuration: self.configuration.clone(),
            project: self.project.clone(),
            artifacts: self.artifact_names(),
            disabled: self.disabled,
            timeout: self.timeout,
            min_cores: self.min_cores,
            max_cores: self.max_cores,
            min_ram_gb: self.min_ram_gb,
            min_disk_gb: self.min_disk_gb,
            max_retries: self.max_retries,
            retry_wait_seconds: self.retry_wait_seconds,
        }
    }
}

/// The slice of a test definition the scheduler needs constantly; denormalized
/// onto the Test entity so scheduling never touches the full definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDefinitionSummary {
    pub name: String,
    pub machine_os: OsConfig,
    pub kind: TestKind,
    pub configuration: String,
    pub project: String,
    pub artifacts: Vec<String>,
    pub disabled: bool,
    pub timeout: u64,
    pub min_cores: u32,
    pub max_cores: u32,
    pub min_ram_gb: u32,
    pub min_disk_gb: u32,
    pub max_retries: u32,
    pub retry_wait_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_env() -> ResolvedEnvironment {
        ResolvedEnvironment {
            platform: Platform::Linux,
            image: Image::DockerfileInline {
                contents: "FROM ubuntu:24.04\n".into(),
            },
            variables: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            setup_script_contents: String::new(),
            test_configuration: String::new(),
            test_stages: vec![],
            test_timeout: 0,
            test_min_cores: 0,
            test_max_cores: 0,
            test_min_ram_gb: 0,
            test_min_disk_gb: 0,
            test_max_retries: 0,
            test_retry_wait_seconds: 0,
        }
    }

    fn minimal_test(name: &str) -> TestDefinition {
        TestDefinition {
            name: name.into(),
            kind: TestKind::Build,
            environment_name: "env".into(),
            environment_mixins: vec![],
            environment: minimal_env(),
            dependencies: BTreeMap::new(),
            variables: BTreeMap::new(),
            stages: vec![Stage {
                command: "./build.sh".into(),
                cleanup: String::new(),
                artifacts: vec![ArtifactDef {
                    name: "out".into(),
                    directory: "out".into(),
                }],
                order: 0,
            }],
            configuration: "linux".into(),
            project: String::new(),
            disabled: false,
            timeout: 300,
            min_cores: 0,
            max_cores: 0,
            min_ram_gb: 0,
            min_disk_gb: 0,
            max_retries: 0,
            retry_wait_seconds: 0,
            hash: String::new(),
        }
    }

    #[test]
    fn content_hash_ignores_stored_hash() {
        let mut a = minimal_test("b");
        let h = a.content_hash();
        a.hash = h.clone();
        assert_eq!(a.content_hash(), h);
    }

    #[test]
    fn content_hash_differs_on_command_change() {
        let a = minimal_test("b");
        let mut b = minimal_test("b");
        b.stages[0].command = "./build.sh --fast".into();
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn reponame_and_hash_split() {
        let r = RepoReference::Pin {
            reference: "core/0123456789012345678901234567890123456789".into(),
            branch: "master".into(),
            auto: true,
            prioritize: false,
        };
        assert_eq!(r.reponame(), "core");
        assert_eq!(
            r.commit_hash(),
            "0123456789012345678901234567890123456789"
        );
    }

    #[test]
    fn machine_os_follows_platform_and_image() {
        let mut env = minimal_env();
        assert_eq!(env.machine_os(), OsConfig::LinuxWithDocker);
        env.image = Image::Ami {
            base_ami: "ami-123".into(),
        };
        assert_eq!(
            env.machine_os(),
            OsConfig::LinuxOneshot {
                ami: "ami-123".into()
            }
        );
    }
}
