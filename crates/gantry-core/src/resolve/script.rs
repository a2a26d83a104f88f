//! Boundary deserializer for test-definition files.
//!
//! Parses the three recognized on-disk formats (`testDefinitions.json`,
//! `testDefinitions.yml`, `*.testlooper.yml`) into the closed parse-time
//! shapes, applying include-variable substitution as the text is shaped.
//! Validation happens once here; the resolver only ever sees well-formed
//! values.

use std::collections::BTreeMap;

use serde::Deserialize;

use gantry_db::defs::{ArtifactDef, Image, Platform, RepoReference, Stage, TestDependency, TestKind};

use super::ResolveError;

/// Substitution depth bound: `${A}` expanding to `${B}` expanding to ... is
/// legal, unbounded self-reference is not.
const MAX_SUBSTITUTION_DEPTH: usize = 10;

// ---------------------------------------------------------------------------
// Parse-time shapes handed to the resolver
// ---------------------------------------------------------------------------

/// An `includes` entry: a path plus variables visible to the included file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeDef {
    pub path: String,
    pub variables: BTreeMap<String, String>,
}

/// Fields shared by both environment variants before merging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvBody {
    pub variables: BTreeMap<String, String>,
    pub dependencies: BTreeMap<String, TestDependency>,
    pub setup_script_contents: String,
    pub test_configuration: Option<String>,
    pub test_stages: Vec<Stage>,
    pub test_timeout: Option<u64>,
    pub test_min_cores: Option<u32>,
    pub test_max_cores: Option<u32>,
    pub test_min_ram_gb: Option<u32>,
    pub test_min_disk_gb: Option<u32>,
    pub test_max_retries: Option<u32>,
    pub test_retry_wait_seconds: Option<u64>,
}

/// An environment as parsed: either concrete (platform + image) or an
/// import of other environments with an overlay body.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEnvironment {
    Environment {
        platform: Platform,
        image: Image,
        body: EnvBody,
    },
    Import {
        /// `"envname"` (same commit) or `"refname/envname"`.
        imports: Vec<String>,
        body: EnvBody,
    },
}

impl ParsedEnvironment {
    pub fn body(&self) -> &EnvBody {
        match self {
            ParsedEnvironment::Environment { body, .. } => body,
            ParsedEnvironment::Import { body, .. } => body,
        }
    }
}

/// A test as parsed, before its environment is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTest {
    pub name: String,
    pub kind: TestKind,
    pub environment_name: String,
    pub environment_mixins: Vec<String>,
    pub dependencies: BTreeMap<String, TestDependency>,
    pub variables: BTreeMap<String, String>,
    pub stages: Vec<Stage>,
    pub configuration: Option<String>,
    pub project: String,
    pub disabled: bool,
    pub timeout: Option<u64>,
    pub min_cores: Option<u32>,
    pub max_cores: Option<u32>,
    pub min_ram_gb: Option<u32>,
    pub min_disk_gb: Option<u32>,
    pub max_retries: Option<u32>,
    pub retry_wait_seconds: Option<u64>,
}

/// Everything one definitions file contributes.
#[derive(Debug, Clone, Default)]
pub struct ParsedDefinitions {
    pub tests: BTreeMap<String, ParsedTest>,
    pub environments: BTreeMap<String, ParsedEnvironment>,
    pub repos: BTreeMap<String, RepoReference>,
    pub includes: Vec<IncludeDef>,
    pub prioritize_globs: Vec<String>,
}

// ---------------------------------------------------------------------------
// Raw serde shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawScript {
    #[serde(default)]
    repos: BTreeMap<String, RawRepoRef>,
    #[serde(default)]
    environments: BTreeMap<String, RawEnvironment>,
    #[serde(default)]
    builds: BTreeMap<String, RawTest>,
    #[serde(default)]
    tests: BTreeMap<String, RawTest>,
    #[serde(default)]
    deployments: BTreeMap<String, RawTest>,
    #[serde(default)]
    includes: Vec<RawInclude>,
    #[serde(default)]
    prioritize: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRepoRef {
    /// `"reponame/hash"` shorthand for a bare reference.
    Plain(String),
    Detailed {
        #[serde(default)]
        reference: Option<String>,
        #[serde(default)]
        import: Option<String>,
        #[serde(default)]
        branch: Option<String>,
        #[serde(default)]
        auto: bool,
        #[serde(default)]
        prioritize: bool,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawInclude {
    Plain(String),
    Detailed {
        path: String,
        #[serde(default)]
        variables: BTreeMap<String, String>,
    },
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawEnvironment {
    #[serde(default)]
    base: Vec<String>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    image: Option<RawImage>,
    #[serde(default)]
    variables: BTreeMap<String, String>,
    #[serde(default)]
    dependencies: BTreeMap<String, RawDependency>,
    #[serde(default)]
    setup_script_contents: String,
    #[serde(default)]
    test_configuration: Option<String>,
    #[serde(default)]
    test_stages: Vec<RawStage>,
    #[serde(default)]
    test_timeout: Option<u64>,
    #[serde(default)]
    test_min_cores: Option<u32>,
    #[serde(default)]
    test_max_cores: Option<u32>,
    #[serde(default)]
    test_min_ram_gb: Option<u32>,
    #[serde(default)]
    test_min_disk_gb: Option<u32>,
    #[serde(default)]
    test_max_retries: Option<u32>,
    #[serde(default)]
    test_retry_wait_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawImage {
    /// Path of a dockerfile within the defining repo at the defining
    /// commit; inlined during resolution.
    #[serde(default)]
    dockerfile: Option<String>,
    #[serde(default)]
    dockerfile_contents: Option<String>,
    #[serde(default)]
    base_ami: Option<String>,
}

/// A declared dependency. Exactly one of `build`/`source` must be present.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDependency {
    /// Internal build name, e.g. `"build/linux"`; with `repo`, a build in
    /// a referenced repo.
    #[serde(default)]
    build: Option<String>,
    /// Repo-reference name whose source tree is wanted.
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    repo: Option<String>,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawStage {
    Plain(String),
    Detailed {
        command: String,
        #[serde(default)]
        cleanup: Option<String>,
        #[serde(default)]
        artifacts: Vec<RawArtifact>,
        #[serde(default)]
        order: i64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawArtifact {
    Plain(String),
    Detailed {
        name: String,
        #[serde(default)]
        directory: Option<String>,
    },
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawTest {
    #[serde(default)]
    environment: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    stages: Vec<RawStage>,
    #[serde(default)]
    dependencies: BTreeMap<String, RawDependency>,
    #[serde(default)]
    variables: BTreeMap<String, String>,
    #[serde(default)]
    configuration: Option<String>,
    #[serde(default)]
    project: Option<String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    min_cores: Option<u32>,
    #[serde(default)]
    max_cores: Option<u32>,
    #[serde(default)]
    min_ram_gb: Option<u32>,
    #[serde(default)]
    min_disk_gb: Option<u32>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    retry_wait_seconds: Option<u64>,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Parse one definitions file.
///
/// `repo_name`/`commit_hash` identify the commit whose definitions these
/// become (for includes, the *including* commit so environments behave as
/// if written inline). `variable_definitions` are substituted into every
/// string field before shaping.
pub fn extract_from_str(
    repo_name: &str,
    commit_hash: &str,
    extension: &str,
    text: &str,
    variable_definitions: &BTreeMap<String, String>,
) -> Result<ParsedDefinitions, ResolveError> {
    let raw: RawScript = match extension {
        ".json" => serde_json::from_str(text).map_err(|e| {
            ResolveError::resolution(format!(
                "{repo_name}/{commit_hash}: invalid definitions json: {e}"
            ))
        })?,
        ".yml" | ".yaml" => serde_yaml::from_str(text).map_err(|e| {
            ResolveError::resolution(format!(
                "{repo_name}/{commit_hash}: invalid definitions yaml: {e}"
            ))
        })?,
        other => {
            return Err(ResolveError::resolution(format!(
                "unrecognized definitions extension {other:?}"
            )));
        }
    };

    let vars = variable_definitions;

    let mut repos = BTreeMap::new();
    for (name, reference) in raw.repos {
        repos.insert(name.clone(), shape_repo_ref(&name, reference, vars)?);
    }

    let mut environments = BTreeMap::new();
    for (name, env) in raw.environments {
        environments.insert(name.clone(), shape_environment(&name, env, vars)?);
    }

    let mut tests = BTreeMap::new();
    for (kind, raw_tests) in [
        (TestKind::Build, raw.builds),
        (TestKind::Test, raw.tests),
        (TestKind::Deployment, raw.deployments),
    ] {
        for (name, test) in raw_tests {
            if tests.contains_key(&name) {
                return Err(ResolveError::resolution(format!(
                    "test {name:?} defined more than once"
                )));
            }
            let shaped = shape_test(&name, kind, test, vars)?;
            tests.insert(name, shaped);
        }
    }

    let includes = raw
        .includes
        .into_iter()
        .map(|i| match i {
            RawInclude::Plain(path) => IncludeDef {
                path: substitute(&path, vars),
                variables: BTreeMap::new(),
            },
            RawInclude::Detailed { path, variables } => IncludeDef {
                path: substitute(&path, vars),
                variables: variables
                    .into_iter()
                    .map(|(k, v)| (k, substitute(&v, vars)))
                    .collect(),
            },
        })
        .collect();

    Ok(ParsedDefinitions {
        tests,
        environments,
        repos,
        includes,
        prioritize_globs: raw.prioritize,
    })
}

fn shape_repo_ref(
    name: &str,
    raw: RawRepoRef,
    vars: &BTreeMap<String, String>,
) -> Result<RepoReference, ResolveError> {
    match raw {
        RawRepoRef::Plain(reference) => Ok(RepoReference::Reference {
            reference: substitute(&reference, vars),
        }),
        RawRepoRef::Detailed {
            reference,
            import,
            branch,
            auto,
            prioritize,
        } => match (reference, import, branch) {
            (None, Some(import), None) => {
                if auto || prioritize {
                    return Err(ResolveError::resolution(format!(
                        "repo {name:?}: imports can't be marked auto or prioritize"
                    )));
                }
                Ok(RepoReference::Import {
                    import: substitute(&import, vars),
                })
            }
            (Some(reference), None, Some(branch)) => Ok(RepoReference::Pin {
                reference: substitute(&reference, vars),
                branch: substitute(&branch, vars),
                auto,
                prioritize,
            }),
            (Some(reference), None, None) => {
                if auto || prioritize {
                    return Err(ResolveError::resolution(format!(
                        "repo {name:?}: bare references can't be marked auto or prioritize"
                    )));
                }
                Ok(RepoReference::Reference {
                    reference: substitute(&reference, vars),
                })
            }
            _ => Err(ResolveError::resolution(format!(
                "repo {name:?}: define exactly one of 'reference' (with optional 'branch') or 'import'"
            ))),
        },
    }
}

fn shape_environment(
    name: &str,
    raw: RawEnvironment,
    vars: &BTreeMap<String, String>,
) -> Result<ParsedEnvironment, ResolveError> {
    let body = EnvBody {
        variables: raw
            .variables
            .into_iter()
            .map(|(k, v)| (k, substitute(&v, vars)))
            .collect(),
        dependencies: shape_dependencies(name, raw.dependencies, vars)?,
        setup_script_contents: substitute(&raw.setup_script_contents, vars),
        test_configuration: raw.test_configuration.map(|c| substitute(&c, vars)),
        test_stages: raw
            .test_stages
            .into_iter()
            .map(|s| shape_stage(s, vars))
            .collect(),
        test_timeout: raw.test_timeout,
        test_min_cores: raw.test_min_cores,
        test_max_cores: raw.test_max_cores,
        test_min_ram_gb: raw.test_min_ram_gb,
        test_min_disk_gb: raw.test_min_disk_gb,
        test_max_retries: raw.test_max_retries,
        test_retry_wait_seconds: raw.test_retry_wait_seconds,
    };

    if !raw.base.is_empty() {
        if raw.platform.is_some() || raw.image.is_some() {
            return Err(ResolveError::resolution(format!(
                "environment {name:?}: 'base' imports can't also declare platform or image"
            )));
        }
        return Ok(ParsedEnvironment::Import {
            imports: raw.base.iter().map(|b| substitute(b, vars)).collect(),
            body,
        });
    }

    let platform = match raw.platform.as_deref() {
        Some("linux") => Platform::Linux,
        Some("windows") => Platform::Windows,
        Some(other) => {
            return Err(ResolveError::resolution(format!(
                "environment {name:?}: unknown platform {other:?}"
            )));
        }
        None => {
            return Err(ResolveError::resolution(format!(
                "environment {name:?}: concrete environments need a platform"
            )));
        }
    };

    let image = match raw.image {
        Some(image) => shape_image(name, image, vars)?,
        None => {
            return Err(ResolveError::resolution(format!(
                "environment {name:?}: concrete environments need an image"
            )));
        }
    };

    Ok(ParsedEnvironment::Environment {
        platform,
        image,
        body,
    })
}

fn shape_image(
    env_name: &str,
    raw: RawImage,
    vars: &BTreeMap<String, String>,
) -> Result<Image, ResolveError> {
    match (raw.dockerfile, raw.dockerfile_contents, raw.base_ami) {
        (Some(path), None, None) => Ok(Image::Dockerfile {
            // Filled in by the resolver with the defining repo/commit.
            repo: String::new(),
            commit_hash: String::new(),
            path: substitute(&path, vars),
        }),
        (None, Some(contents), None) => Ok(Image::DockerfileInline {
            contents: substitute(&contents, vars),
        }),
        (None, None, Some(base_ami)) => Ok(Image::Ami {
            base_ami: substitute(&base_ami, vars),
        }),
        _ => Err(ResolveError::resolution(format!(
            "environment {env_name:?}: image needs exactly one of dockerfile, dockerfile_contents, base_ami"
        ))),
    }
}

fn shape_dependencies(
    owner: &str,
    raw: BTreeMap<String, RawDependency>,
    vars: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, TestDependency>, ResolveError> {
    let mut out = BTreeMap::new();
    for (expose_as, dep) in raw {
        let shaped = match (dep.build, dep.source) {
            (Some(build), None) => {
                let build = substitute(&build, vars);
                match dep.repo {
                    Some(repo) => TestDependency::UnresolvedExternalBuild {
                        repo_name: substitute(&repo, vars),
                        name: build,
                    },
                    None => TestDependency::InternalBuild { name: build },
                }
            }
            (None, Some(source)) => {
                if dep.repo.is_some() {
                    return Err(ResolveError::resolution(format!(
                        "{owner:?} dependency {expose_as:?}: 'source' already names a repo reference"
                    )));
                }
                TestDependency::UnresolvedSource {
                    repo_name: substitute(&source, vars),
                    path: dep.path.map(|p| substitute(&p, vars)),
                }
            }
            _ => {
                return Err(ResolveError::resolution(format!(
                    "{owner:?} dependency {expose_as:?}: define exactly one of 'build' or 'source'"
                )));
            }
        };
        out.insert(substitute(&expose_as, vars), shaped);
    }
    Ok(out)
}

fn shape_stage(raw: RawStage, vars: &BTreeMap<String, String>) -> Stage {
    match raw {
        RawStage::Plain(command) => Stage {
            command: substitute(&command, vars),
            cleanup: String::new(),
            artifacts: vec![],
            order: 0,
        },
        RawStage::Detailed {
            command,
            cleanup,
            artifacts,
            order,
        } => Stage {
            command: substitute(&command, vars),
            cleanup: cleanup.map(|c| substitute(&c, vars)).unwrap_or_default(),
            artifacts: artifacts
                .into_iter()
                .map(|a| match a {
                    RawArtifact::Plain(name) => {
                        let name = substitute(&name, vars);
                        ArtifactDef {
                            directory: name.clone(),
                            name,
                        }
                    }
                    RawArtifact::Detailed { name, directory } => {
                        let name = substitute(&name, vars);
                        ArtifactDef {
                            directory: directory
                                .map(|d| substitute(&d, vars))
                                .unwrap_or_else(|| name.clone()),
                            name,
                        }
                    }
                })
                .collect(),
            order,
        },
    }
}

fn shape_test(
    name: &str,
    kind: TestKind,
    raw: RawTest,
    vars: &BTreeMap<String, String>,
) -> Result<ParsedTest, ResolveError> {
    let environment = raw.environment.as_deref().unwrap_or_default();
    if environment.is_empty() {
        return Err(ResolveError::resolution(format!(
            "test {name:?}: missing environment"
        )));
    }
    let mut env_parts = environment.split('+').map(|p| substitute(p.trim(), vars));
    let environment_name = env_parts.next().unwrap_or_default();
    let environment_mixins: Vec<String> = env_parts.collect();

    let mut stages: Vec<Stage> = raw
        .stages
        .into_iter()
        .map(|s| shape_stage(s, vars))
        .collect();

    // A naked `command` is shorthand for a single stage; for builds it
    // implies the unnamed artifact covering the whole build output dir.
    if let Some(command) = raw.command {
        if !stages.is_empty() {
            return Err(ResolveError::resolution(format!(
                "test {name:?}: use either 'command' or 'stages', not both"
            )));
        }
        stages.push(Stage {
            command: substitute(&command, vars),
            cleanup: String::new(),
            artifacts: if kind == TestKind::Build {
                vec![ArtifactDef::default()]
            } else {
                vec![]
            },
            order: 0,
        });
    }

    Ok(ParsedTest {
        name: name.to_string(),
        kind,
        environment_name,
        environment_mixins,
        dependencies: shape_dependencies(name, raw.dependencies, vars)?,
        variables: raw
            .variables
            .into_iter()
            .map(|(k, v)| (k, substitute(&v, vars)))
            .collect(),
        stages,
        configuration: raw.configuration.map(|c| substitute(&c, vars)),
        project: raw.project.map(|p| substitute(&p, vars)).unwrap_or_default(),
        disabled: raw.disabled,
        timeout: raw.timeout,
        min_cores: raw.min_cores,
        max_cores: raw.max_cores,
        min_ram_gb: raw.min_ram_gb,
        min_disk_gb: raw.min_disk_gb,
        max_retries: raw.max_retries,
        retry_wait_seconds: raw.retry_wait_seconds,
    })
}

// ---------------------------------------------------------------------------
// Variable substitution
// ---------------------------------------------------------------------------

/// Expand `${NAME}` occurrences from `vars`, repeatedly, up to the depth
/// bound. Unknown variables are left intact.
pub fn substitute(text: &str, vars: &BTreeMap<String, String>) -> String {
    let mut current = text.to_string();
    for _ in 0..MAX_SUBSTITUTION_DEPTH {
        let next = substitute_once(&current, vars);
        if next == current {
            return next;
        }
        current = next;
    }
    current
}

fn substitute_once(text: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Fixpoint-substitute a variable map against itself, bounded.
pub fn substitute_map(vars: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out = vars.clone();
    for _ in 0..MAX_SUBSTITUTION_DEPTH {
        let next: BTreeMap<String, String> = out
            .iter()
            .map(|(k, v)| (k.clone(), substitute_once(v, &out)))
            .collect();
        if next == out {
            break;
        }
        out = next;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_vars() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn parses_minimal_yaml() {
        let text = r#"
environments:
  linux:
    platform: linux
    image:
      dockerfile_contents: "FROM ubuntu:24.04"
builds:
  build/core:
    environment: linux
    command: ./build.sh
tests:
  test/core:
    environment: linux
    command: ./test.sh
    dependencies:
      build: { build: build/core }
"#;
        let parsed = extract_from_str("repo", &"a".repeat(40), ".yml", text, &no_vars()).unwrap();
        assert_eq!(parsed.tests.len(), 2);
        let build = &parsed.tests["build/core"];
        assert_eq!(build.kind, TestKind::Build);
        // Naked build command implies the unnamed whole-output artifact.
        assert_eq!(build.stages.len(), 1);
        assert_eq!(build.stages[0].artifacts, vec![ArtifactDef::default()]);
        let test = &parsed.tests["test/core"];
        assert_eq!(
            test.dependencies["build"],
            TestDependency::InternalBuild {
                name: "build/core".into()
            }
        );
    }

    #[test]
    fn repo_refs_shapes() {
        let text = r#"
repos:
  plain: "core/0000000000000000000000000000000000000000"
  pinned:
    reference: "core/0000000000000000000000000000000000000000"
    branch: master
    auto: true
  imported:
    import: "pinned/sub"
"#;
        let parsed = extract_from_str("repo", &"a".repeat(40), ".yml", text, &no_vars()).unwrap();
        assert!(matches!(
            parsed.repos["plain"],
            RepoReference::Reference { .. }
        ));
        assert!(matches!(
            parsed.repos["pinned"],
            RepoReference::Pin { auto: true, .. }
        ));
        assert!(parsed.repos["imported"].is_import());
    }

    #[test]
    fn include_variables_substitute() {
        let mut vars = BTreeMap::new();
        vars.insert("flavor".to_string(), "release".to_string());
        let text = r#"
environments:
  linux:
    platform: linux
    image: { dockerfile_contents: "FROM x" }
builds:
  build/${flavor}:
    environment: linux
    command: "./build.sh --flavor ${flavor}"
"#;
        let parsed = extract_from_str("repo", &"a".repeat(40), ".yml", text, &vars).unwrap();
        let build = &parsed.tests["build/release"];
        assert_eq!(build.stages[0].command, "./build.sh --flavor release");
    }

    #[test]
    fn rejects_both_command_and_stages() {
        let text = r#"
environments:
  linux: { platform: linux, image: { dockerfile_contents: "FROM x" } }
builds:
  b:
    environment: linux
    command: ./a.sh
    stages:
      - ./b.sh
"#;
        let err = extract_from_str("repo", &"a".repeat(40), ".yml", text, &no_vars()).unwrap_err();
        assert!(err.to_string().contains("'command' or 'stages'"));
    }

    #[test]
    fn substitution_is_bounded() {
        let mut vars = BTreeMap::new();
        vars.insert("a".to_string(), "${a}x".to_string());
        // Must terminate; exact expansion depth is an implementation bound.
        let out = substitute("${a}", &vars);
        assert!(out.contains('x'));
    }

    #[test]
    fn environment_mixins_split() {
        let text = r#"
environments:
  linux: { platform: linux, image: { dockerfile_contents: "FROM x" } }
tests:
  t:
    environment: "linux + asan + slow"
    command: ./t.sh
"#;
        let parsed = extract_from_str("repo", &"a".repeat(40), ".yml", text, &no_vars()).unwrap();
        let t = &parsed.tests["t"];
        assert_eq!(t.environment_name, "linux");
        assert_eq!(t.environment_mixins, vec!["asan", "slow"]);
    }
}
