//! Definition-resolver integration tests over real git repositories.

use std::sync::Arc;

use gantry_core::git::{GitCache, RepoCacheSet};
use gantry_core::resolve::{DefinitionResolver, ResolveError};
use gantry_db::defs::{Image, RepoReference, TestDependency};
use gantry_test_utils::GitFixture;

const HASH_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

/// Clone every fixture repo into a cache set and build a resolver on it.
fn resolver_for(fixture: &GitFixture) -> DefinitionResolver {
    let caches = Arc::new(RepoCacheSet::new(fixture.scratch_dir("resolver-cache")));
    for (name, url) in fixture.repo_urls() {
        GitCache::clone_from(&caches.get(&name), &url).expect("clone fixture");
    }
    DefinitionResolver::new(Arc::new(move |name: &str| caches.get_initialized(name)))
}

fn simple_definitions() -> &'static str {
    r#"
environments:
  linux:
    platform: linux
    image: { base_ami: "ami-1" }
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
"#
}

#[test]
fn resolution_is_deterministic() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let hash = fixture.repo("core").commit(
        &[("testDefinitions.yml", Some(simple_definitions()))],
        "add definitions",
    );

    let mut first = resolver_for(&fixture);
    let mut second = resolver_for(&fixture);
    let tests_a = first.test_definitions_for("core", &hash).unwrap();
    let tests_b = second.test_definitions_for("core", &hash).unwrap();

    assert_eq!(tests_a, tests_b);
    let json_a = serde_json::to_string(&tests_a).unwrap();
    let json_b = serde_json::to_string(&tests_b).unwrap();
    assert_eq!(json_a, json_b);
    assert!(!tests_a["build/core"].hash.is_empty());
}

#[test]
fn identical_definitions_in_different_repos_share_hashes() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("alpha");
    fixture.create_repo("beta");
    let hash_a = fixture.repo("alpha").commit(
        &[("testDefinitions.yml", Some(simple_definitions()))],
        "defs",
    );
    let hash_b = fixture.repo("beta").commit(
        &[("testDefinitions.yml", Some(simple_definitions()))],
        "defs, different message",
    );
    assert_ne!(hash_a, hash_b);

    let mut resolver = resolver_for(&fixture);
    let alpha = resolver.test_definitions_for("alpha", &hash_a).unwrap();
    let beta = resolver.test_definitions_for("beta", &hash_b).unwrap();

    assert_eq!(alpha["build/core"].hash, beta["build/core"].hash);
    assert_eq!(alpha["test/core"].hash, beta["test/core"].hash);
}

#[test]
fn internal_build_dependency_resolves_to_hash() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let hash = fixture
        .repo("core")
        .commit(&[("testDefinitions.yml", Some(simple_definitions()))], "defs");

    let mut resolver = resolver_for(&fixture);
    let tests = resolver.test_definitions_for("core", &hash).unwrap();

    let build_hash = &tests["build/core"].hash;
    match &tests["test/core"].dependencies["build"] {
        TestDependency::Build {
            build_hash: dep_hash,
            name,
            artifact,
        } => {
            assert_eq!(dep_hash, build_hash);
            assert_eq!(name, "build/core");
            assert_eq!(artifact, "");
        }
        other => panic!("expected resolved build dependency, got {other:?}"),
    }
}

#[test]
fn external_build_dependency_through_repo_reference() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("deps");
    let deps_hash = fixture.repo("deps").commit(
        &[("testDefinitions.yml", Some(simple_definitions()))],
        "deps defs",
    );

    fixture.create_repo("app");
    let app_defs = format!(
        r#"
repos:
  deps: "deps/{deps_hash}"
environments:
  linux:
    platform: linux
    image: {{ base_ami: "ami-1" }}
tests:
  test/app:
    environment: linux
    command: ./app-test.sh
    dependencies:
      tool: {{ build: "build/core", repo: deps }}
"#
    );
    let app_hash = fixture
        .repo("app")
        .commit(&[("testDefinitions.yml", Some(&app_defs))], "app defs");

    let mut resolver = resolver_for(&fixture);
    let deps_tests = resolver.test_definitions_for("deps", &deps_hash).unwrap();
    let app_tests = resolver.test_definitions_for("app", &app_hash).unwrap();

    match &app_tests["test/app"].dependencies["tool"] {
        TestDependency::Build { build_hash, .. } => {
            assert_eq!(build_hash, &deps_tests["build/core"].hash);
        }
        other => panic!("expected build dependency, got {other:?}"),
    }
}

#[test]
fn import_chains_resolve_to_imported_references() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("base");
    let inner = format!(
        r#"
repos:
  tools: "tools/{HASH_A}"
environments:
  linux:
    platform: linux
    image: {{ base_ami: "ami-1" }}
"#
    );
    let base_hash = fixture
        .repo("base")
        .commit(&[("testDefinitions.yml", Some(&inner))], "base defs");

    fixture.create_repo("outer");
    let outer = format!(
        r#"
repos:
  base: "base/{base_hash}"
  tools:
    import: "base/tools"
environments:
  linux:
    platform: linux
    image: {{ base_ami: "ami-1" }}
"#
    );
    let outer_hash = fixture
        .repo("outer")
        .commit(&[("testDefinitions.yml", Some(&outer))], "outer defs");

    let mut resolver = resolver_for(&fixture);
    let repos = resolver.repo_references_for("outer", &outer_hash).unwrap();
    match &repos["tools"] {
        RepoReference::ImportedReference {
            reference,
            import_source,
            ..
        } => {
            assert_eq!(reference, &format!("tools/{HASH_A}"));
            assert_eq!(import_source, "base/tools");
        }
        other => panic!("expected imported reference, got {other:?}"),
    }
}

#[test]
fn dockerfile_contents_are_inlined() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let defs = r#"
environments:
  linux:
    platform: linux
    image: { dockerfile: "ci/Dockerfile" }
builds:
  b:
    environment: linux
    command: ./build.sh
"#;
    let hash = fixture.repo("core").commit(
        &[
            ("testDefinitions.yml", Some(defs)),
            ("ci/Dockerfile", Some("FROM ubuntu:24.04\nRUN apt-get update\n")),
        ],
        "defs with dockerfile",
    );

    let mut resolver = resolver_for(&fixture);
    let envs = resolver.environments_for("core", &hash).unwrap();
    match &envs["linux"].image {
        Image::DockerfileInline { contents } => {
            assert!(contents.contains("FROM ubuntu:24.04"));
        }
        other => panic!("expected inlined dockerfile, got {other:?}"),
    }
}

#[test]
fn mixins_merge_variables_through_synthetic_environments() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let defs = r#"
environments:
  linux:
    platform: linux
    image: { base_ami: "ami-1" }
    variables: { BASE: "1", SHARED: "base" }
  asan:
    base: [linux]
    variables: { ASAN: "1", SHARED: "asan" }
tests:
  t:
    environment: "linux + asan"
    command: ./t.sh
"#;
    let hash = fixture
        .repo("core")
        .commit(&[("testDefinitions.yml", Some(defs))], "mixin defs");

    let mut resolver = resolver_for(&fixture);
    let tests = resolver.test_definitions_for("core", &hash).unwrap();
    let t = &tests["t"];
    assert_eq!(t.variables["BASE"], "1");
    assert_eq!(t.variables["ASAN"], "1");
    // The mixin layered after the base wins shared names.
    assert_eq!(t.variables["SHARED"], "asan");
}

#[test]
fn prioritize_globs_disable_unmatched_tests() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let defs = r#"
prioritize: ["test/fast*"]
environments:
  linux:
    platform: linux
    image: { base_ami: "ami-1" }
tests:
  test/fast-a:
    environment: linux
    command: ./a.sh
  test/slow-b:
    environment: linux
    command: ./b.sh
"#;
    let hash = fixture
        .repo("core")
        .commit(&[("testDefinitions.yml", Some(defs))], "prioritized defs");

    let mut resolver = resolver_for(&fixture);
    let tests = resolver.test_definitions_for("core", &hash).unwrap();
    assert!(!tests["test/fast-a"].disabled);
    assert!(tests["test/slow-b"].disabled);
}

#[test]
fn source_dependency_substitutes_subpath_history() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let repo = fixture.repo("core");
    let lib_commit = repo.commit(&[("lib/code.txt", Some("v1"))], "lib v1");
    repo.commit(&[("unrelated.txt", Some("x"))], "unrelated change");
    let defs = r#"
environments:
  linux:
    platform: linux
    image: { base_ami: "ami-1" }
tests:
  t:
    environment: linux
    command: ./t.sh
    dependencies:
      lib: { source: self, path: "lib" }
"#;
    let base = repo.head("master");
    let final_defs = format!("repos:\n  self: \"core/{base}\"\n{defs}");
    let head = fixture
        .repo("core")
        .commit(&[("testDefinitions.yml", Some(&final_defs))], "defs");

    let mut resolver = resolver_for(&fixture);
    let tests = resolver.test_definitions_for("core", &head).unwrap();
    match &tests["t"].dependencies["lib"] {
        TestDependency::Source {
            repo, commit_hash, ..
        } => {
            assert_eq!(repo, "core");
            // The most recent commit touching lib/ is the v1 commit, not
            // the later unrelated ones.
            assert_eq!(commit_hash, &lib_commit);
        }
        other => panic!("expected source dependency, got {other:?}"),
    }
}

#[test]
fn include_cycle_hits_the_attempt_cap() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    // Two files include each other with ever-growing variables, so every
    // expansion is distinct and only the cap stops it.
    let root = r#"
includes:
  - { path: "/ci/a.yml", variables: { n: "0" } }
"#;
    let a = r#"
includes:
  - { path: "./b.yml", variables: { n: "${n}x" } }
"#;
    let b = r#"
includes:
  - { path: "./a.yml", variables: { n: "${n}y" } }
"#;
    let hash = fixture.repo("core").commit(
        &[
            ("testDefinitions.yml", Some(root)),
            ("ci/a.yml", Some(a)),
            ("ci/b.yml", Some(b)),
        ],
        "cyclic includes",
    );

    let mut resolver = resolver_for(&fixture);
    let err = resolver.test_definitions_for("core", &hash).unwrap_err();
    match err {
        ResolveError::Resolution(message) => {
            assert!(
                message.contains("Exceeded the maximum number of file includes: 128"),
                "unexpected message: {message}"
            );
        }
        other => panic!("expected resolution error, got {other:?}"),
    }
}

#[test]
fn repeated_identical_include_is_deduplicated() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let root = r#"
includes:
  - "/ci/shared.yml"
"#;
    // shared.yml includes itself with identical variables: deduplicated,
    // not an error.
    let shared = r#"
includes:
  - "./shared.yml"
environments:
  linux:
    platform: linux
    image: { base_ami: "ami-1" }
tests:
  t:
    environment: linux
    command: ./t.sh
"#;
    let hash = fixture.repo("core").commit(
        &[
            ("testDefinitions.yml", Some(root)),
            ("ci/shared.yml", Some(shared)),
        ],
        "self include",
    );

    let mut resolver = resolver_for(&fixture);
    let tests = resolver.test_definitions_for("core", &hash).unwrap();
    assert!(tests.contains_key("t"));
}

#[test]
fn duplicate_name_in_include_is_rejected() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let root = r#"
includes:
  - "/ci/extra.yml"
environments:
  linux:
    platform: linux
    image: { base_ami: "ami-1" }
tests:
  t:
    environment: linux
    command: ./t.sh
"#;
    let extra = r#"
tests:
  t:
    environment: linux
    command: ./other.sh
"#;
    let hash = fixture.repo("core").commit(
        &[
            ("testDefinitions.yml", Some(root)),
            ("ci/extra.yml", Some(extra)),
        ],
        "duplicate names",
    );

    let mut resolver = resolver_for(&fixture);
    let err = resolver.test_definitions_for("core", &hash).unwrap_err();
    assert!(err.to_string().contains("can't be defined a second time"));
}

#[test]
fn cyclic_environment_imports_are_rejected() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let defs = r#"
environments:
  a:
    base: [b]
  b:
    base: [a]
tests:
  t:
    environment: a
    command: ./t.sh
"#;
    let hash = fixture
        .repo("core")
        .commit(&[("testDefinitions.yml", Some(defs))], "env cycle");

    let mut resolver = resolver_for(&fixture);
    let err = resolver.test_definitions_for("core", &hash).unwrap_err();
    assert!(
        err.to_string().contains("Circular environment dependency"),
        "unexpected error: {err}"
    );
}

#[test]
fn cyclic_test_dependencies_are_rejected() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let defs = r#"
environments:
  linux:
    platform: linux
    image: { base_ami: "ami-1" }
builds:
  a:
    environment: linux
    command: ./a.sh
    dependencies:
      other: { build: b }
  b:
    environment: linux
    command: ./b.sh
    dependencies:
      other: { build: a }
"#;
    let hash = fixture
        .repo("core")
        .commit(&[("testDefinitions.yml", Some(defs))], "test cycle");

    let mut resolver = resolver_for(&fixture);
    let err = resolver.test_definitions_for("core", &hash).unwrap_err();
    assert!(
        err.to_string().contains("Circular test dependency"),
        "unexpected error: {err}"
    );
}

#[test]
fn missing_repo_is_a_missing_dependency() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let defs = format!(
        r#"
repos:
  gone: "nevercloned/{HASH_A}"
environments:
  linux:
    platform: linux
    image: {{ base_ami: "ami-1" }}
tests:
  t:
    environment: linux
    command: ./t.sh
    dependencies:
      tool: {{ build: "build/core", repo: gone }}
"#
    );
    let hash = fixture
        .repo("core")
        .commit(&[("testDefinitions.yml", Some(&defs))], "missing repo");

    let mut resolver = resolver_for(&fixture);
    let err = resolver.test_definitions_for("core", &hash).unwrap_err();
    match err {
        ResolveError::MissingDependency { reponame, .. } => {
            assert_eq!(reponame, "nevercloned");
        }
        other => panic!("expected missing dependency, got {other:?}"),
    }
}

#[test]
fn disabled_build_reachable_from_enabled_test_is_enabled() {
    let mut fixture = GitFixture::new();
    fixture.create_repo("core");
    let defs = r#"
environments:
  linux:
    platform: linux
    image: { base_ami: "ami-1" }
builds:
  build/core:
    environment: linux
    command: ./build.sh
    disabled: true
tests:
  test/core:
    environment: linux
    command: ./test.sh
    dependencies:
      build: { build: build/core }
"#;
    let hash = fixture
        .repo("core")
        .commit(&[("testDefinitions.yml", Some(defs))], "disabled build");

    let mut resolver = resolver_for(&fixture);
    let tests = resolver.test_definitions_for("core", &hash).unwrap();
    assert!(!tests["build/core"].disabled);
}
