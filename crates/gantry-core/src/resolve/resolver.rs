//! The staged definition resolver.
//!
//! Stages, each cached by `(repo, hash)`:
//!
//! 1. raw extraction (locate + parse the definitions file)
//! 2. repo resolution (follow `Import` chains to concrete references)
//! 3. include expansion (bounded, deduplicated, collision-checked)
//! 4. environment merge (mixins, imports, substitutions, image inlining)
//! 5. test resolution (dependency rewriting, validation, content hashes)

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use gantry_db::defs::{
    Image, Platform, RepoReference, ResolvedEnvironment, Stage, TestDefinition, TestDependency,
};

use crate::git::{is_commit_hash, GitCache};
use crate::glob::glob_match;

use super::script::{
    self, substitute, substitute_map, EnvBody, IncludeDef, ParsedDefinitions, ParsedEnvironment,
    ParsedTest,
};
use super::{ResolveError, MAX_INCLUDE_ATTEMPTS};

/// Stage-cost default when a test declares no timeout: no limit.
const DEFAULT_TIMEOUT: u64 = 0;

type CommitKey = (String, String);

/// Tests/environments/repos of a commit after include expansion.
#[derive(Debug, Clone, Default)]
pub struct PostIncludeDefinitions {
    pub tests: BTreeMap<String, ParsedTest>,
    pub environments: BTreeMap<String, ParsedEnvironment>,
    pub repos: BTreeMap<String, RepoReference>,
}

/// Callback handing the resolver a git cache per repo name, or `None` for
/// repos that have never been cloned.
pub type GitRepoLookup = Arc<dyn Fn(&str) -> Option<Arc<GitCache>> + Send + Sync>;

pub struct DefinitionResolver {
    git_repo_lookup: GitRepoLookup,
    raw_cache: BTreeMap<CommitKey, ParsedDefinitions>,
    raw_path: BTreeMap<CommitKey, String>,
    post_include_cache: BTreeMap<CommitKey, PostIncludeDefinitions>,
    environment_cache: BTreeMap<CommitKey, BTreeMap<String, ResolvedEnvironment>>,
    test_cache: BTreeMap<CommitKey, BTreeMap<String, TestDefinition>>,
}

impl DefinitionResolver {
    pub fn new(git_repo_lookup: GitRepoLookup) -> Self {
        DefinitionResolver {
            git_repo_lookup,
            raw_cache: BTreeMap::new(),
            raw_path: BTreeMap::new(),
            post_include_cache: BTreeMap::new(),
            environment_cache: BTreeMap::new(),
            test_cache: BTreeMap::new(),
        }
    }

    /// Everything the scheduler needs for a commit in one call.
    #[allow(clippy::type_complexity)]
    pub fn test_environment_and_repo_definitions_for(
        &mut self,
        repo: &str,
        hash: &str,
    ) -> Result<
        (
            BTreeMap<String, TestDefinition>,
            BTreeMap<String, ResolvedEnvironment>,
            BTreeMap<String, RepoReference>,
        ),
        ResolveError,
    > {
        let tests = self.test_definitions_for(repo, hash)?;
        let envs = self.environments_for(repo, hash)?;
        let repos = self.repo_references_for(repo, hash)?;
        Ok((tests, envs, repos))
    }

    /// Pins as written in the commit's own definitions file, before any
    /// include processing. Used for pin updates, which must edit the text
    /// the user actually wrote.
    pub fn unprocessed_repo_pins_for(
        &mut self,
        repo: &str,
        hash: &str,
    ) -> Result<BTreeMap<String, RepoReference>, ResolveError> {
        let raw = self.unprocessed_definitions(repo, hash)?;
        Ok(raw
            .repos
            .into_iter()
            .filter(|(_, r)| r.is_pin())
            .collect())
    }

    /// Path of the definitions file for the commit, if one exists and has
    /// been located by a prior stage.
    pub fn definitions_path_for(&mut self, repo: &str, hash: &str) -> Option<String> {
        let key = (repo.to_string(), hash.to_string());
        self.raw_path.get(&key).cloned()
    }

    // -----------------------------------------------------------------
    // Stage 1: raw extraction
    // -----------------------------------------------------------------

    fn unprocessed_definitions(
        &mut self,
        repo: &str,
        hash: &str,
    ) -> Result<ParsedDefinitions, ResolveError> {
        let key = (repo.to_string(), hash.to_string());
        if let Some(parsed) = self.raw_cache.get(&key) {
            return Ok(parsed.clone());
        }

        let parsed = match self.definitions_text_for(repo, hash)? {
            None => ParsedDefinitions::default(),
            Some((text, extension, path)) => {
                self.raw_path.insert(key.clone(), path);
                script::extract_from_str(repo, hash, &extension, &text, &BTreeMap::new())?
            }
        };

        self.raw_cache.insert(key, parsed.clone());
        Ok(parsed)
    }

    /// `(text, extension, path)` of the commit's definitions file, or
    /// `None` when the commit has none (or the hash is the HEAD sentinel).
    fn definitions_text_for(
        &self,
        repo: &str,
        hash: &str,
    ) -> Result<Option<(String, String, String)>, ResolveError> {
        if !is_commit_hash(hash) {
            return Ok(None);
        }

        let git = (self.git_repo_lookup)(repo).ok_or_else(|| ResolveError::missing_repo(repo))?;
        if !git.commit_exists(hash) {
            return Err(ResolveError::missing_commit(repo, hash));
        }

        let Some(path) = git.test_definitions_path(hash) else {
            return Ok(None);
        };
        let Some(text) = git.file_contents(hash, &path) else {
            return Ok(None);
        };
        Ok(Some((text, extension_of(&path), path)))
    }

    fn contents_at(
        &self,
        repo: &str,
        hash: &str,
        path: &str,
    ) -> Result<Option<String>, ResolveError> {
        if !is_commit_hash(hash) {
            return Ok(None);
        }
        let git = (self.git_repo_lookup)(repo).ok_or_else(|| ResolveError::missing_repo(repo))?;
        if !git.commit_exists(hash) {
            return Err(ResolveError::missing_commit(repo, hash));
        }
        Ok(git.file_contents(hash, path))
    }

    // -----------------------------------------------------------------
    // Stage 2: repo resolution
    // -----------------------------------------------------------------

    /// Resolve every symbolic `Import` in `repos` to a concrete reference.
    /// Output maps never contain `Import`.
    fn resolve_repo_definitions(
        &mut self,
        cur_repo: &str,
        repos: &BTreeMap<String, RepoReference>,
    ) -> Result<BTreeMap<String, RepoReference>, ResolveError> {
        // A definitions file carrying the HEAD sentinel is not a real
        // commit: expose the pins, resolve nothing.
        if repos
            .values()
            .any(|r| !r.is_import() && r.commit_hash() == "HEAD")
        {
            return Ok(repos
                .iter()
                .filter(|(_, r)| {
                    matches!(
                        r,
                        RepoReference::Pin { .. } | RepoReference::Reference { .. }
                    )
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect());
        }

        let mut resolved = BTreeMap::new();
        for name in repos.keys() {
            let reference =
                self.resolve_repo_ref(cur_repo, repos, name, &mut Vec::new(), &mut resolved)?;
            resolved.insert(name.clone(), reference);
        }
        Ok(resolved)
    }

    fn resolve_repo_ref(
        &mut self,
        cur_repo: &str,
        repos: &BTreeMap<String, RepoReference>,
        ref_name: &str,
        path_so_far: &mut Vec<String>,
        resolved: &mut BTreeMap<String, RepoReference>,
    ) -> Result<RepoReference, ResolveError> {
        if path_so_far.iter().any(|p| p == ref_name) {
            return Err(ResolveError::resolution(format!(
                "Circular repo-refs: {path_so_far:?}"
            )));
        }

        let reference = repos.get(ref_name).ok_or_else(|| {
            ResolveError::resolution(format!("Can't resolve reference to repo def {ref_name}"))
        })?;

        let RepoReference::Import { import } = reference else {
            return Ok(reference.clone());
        };

        if let Some(already) = resolved.get(ref_name) {
            return Ok(already.clone());
        }

        let import_seq: Vec<&str> = import.split('/').collect();
        if !repos.contains_key(import_seq[0]) {
            return Err(ResolveError::resolution(format!(
                "Can't resolve reference to repo def {}",
                import_seq[0]
            )));
        }

        path_so_far.push(ref_name.to_string());
        let mut subref =
            self.resolve_repo_ref(cur_repo, repos, import_seq[0], path_so_far, resolved)?;
        let mut subref_parent_repo = cur_repo.to_string();

        for step in &import_seq[1..] {
            subref_parent_repo = subref.reponame().to_string();
            let repos_for_subref =
                self.repo_references_for(subref.reponame(), subref.commit_hash())?;
            let Some(next) = repos_for_subref.get(*step) else {
                return Err(ResolveError::resolution(format!(
                    "Can't resolve reference {import:?} because {}/{} doesn't have {step}",
                    subref.reponame(),
                    subref.commit_hash()
                )));
            };
            subref = next.clone();
        }
        path_so_far.pop();

        // Never carry a pin through an import: record where it came from
        // instead, so the UI can explain the chain.
        let orig_reference = match &subref {
            RepoReference::Reference { .. } => String::new(),
            RepoReference::ImportedReference { orig_reference, .. } => orig_reference.clone(),
            RepoReference::Pin { branch, .. } => format!("{subref_parent_repo}/{branch}"),
            RepoReference::Import { .. } => {
                return Err(ResolveError::resolution(format!(
                    "import chain {import:?} ended on an unresolved import"
                )));
            }
        };

        let imported = RepoReference::ImportedReference {
            reference: subref
                .reference_str()
                .expect("non-import reference")
                .to_string(),
            import_source: import.clone(),
            orig_reference,
        };
        resolved.insert(ref_name.to_string(), imported.clone());
        Ok(imported)
    }

    // -----------------------------------------------------------------
    // Stage 3: include expansion
    // -----------------------------------------------------------------

    pub fn repo_references_for(
        &mut self,
        repo: &str,
        hash: &str,
    ) -> Result<BTreeMap<String, RepoReference>, ResolveError> {
        Ok(self.post_include_definitions(repo, hash)?.repos)
    }

    fn post_include_definitions(
        &mut self,
        repo: &str,
        hash: &str,
    ) -> Result<PostIncludeDefinitions, ResolveError> {
        let key = (repo.to_string(), hash.to_string());
        if let Some(post) = self.post_include_cache.get(&key) {
            return Ok(post.clone());
        }

        let parsed = self.unprocessed_definitions(repo, hash)?;
        let mut tests = parsed.tests;
        let mut environments = parsed.environments;
        let mut repos = self.resolve_repo_definitions(repo, &parsed.repos)?;

        if repos
            .values()
            .any(|r| !r.is_import() && r.commit_hash() == "HEAD")
        {
            // Not a real commit; keep the pins visible, define no tests.
            let post = PostIncludeDefinitions {
                tests: BTreeMap::new(),
                environments: BTreeMap::new(),
                repos,
            };
            self.post_include_cache.insert(key, post.clone());
            return Ok(post);
        }

        let root_path = self.raw_path.get(&key).cloned().unwrap_or_default();

        let mut queue: VecDeque<(String, String, String, IncludeDef)> = parsed
            .includes
            .into_iter()
            .map(|i| (repo.to_string(), hash.to_string(), root_path.clone(), i))
            .collect();

        let mut ever_included: HashSet<(String, String, String, Vec<(String, String)>)> =
            HashSet::new();
        let mut attempts = 0usize;

        while let Some((def_repo, def_hash, def_path, include)) = queue.pop_front() {
            let variable_defs = include.variables.clone();
            let vars_key: Vec<(String, String)> = variable_defs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            let (inc_repo, inc_hash, inc_path) =
                resolve_include_string(&repos, &def_repo, &def_hash, &def_path, &include.path)?;

            let include_key = (inc_repo.clone(), inc_hash.clone(), inc_path.clone(), vars_key);
            if ever_included.contains(&include_key) {
                continue;
            }

            attempts += 1;
            if attempts > MAX_INCLUDE_ATTEMPTS {
                return Err(ResolveError::resolution(format!(
                    "Exceeded the maximum number of file includes: {MAX_INCLUDE_ATTEMPTS}"
                )));
            }
            ever_included.insert(include_key);

            let contents = self
                .contents_at(&inc_repo, &inc_hash, &inc_path)?
                .ok_or_else(|| {
                    ResolveError::resolution(format!(
                        "Can't find path {inc_path} in {inc_repo}/{inc_hash}"
                    ))
                })?;

            // Parse under the including commit's identity so environments
            // behave as if written inline.
            let new = script::extract_from_str(
                repo,
                hash,
                &extension_of(&inc_path),
                &contents,
                &variable_defs,
            )?;

            if !new.prioritize_globs.is_empty() {
                return Err(ResolveError::resolution(
                    "include targets can't prioritize individual tests",
                ));
            }

            for (name, reference) in &new.repos {
                if repos.contains_key(name) {
                    return Err(ResolveError::resolution(format!(
                        "Name {name} can't be defined a second time in include {inc_repo}/{inc_hash}/{inc_path}"
                    )));
                }
                if let RepoReference::Pin { auto: true, .. } = reference {
                    return Err(ResolveError::resolution(format!(
                        "Included repo {name} can't be marked 'auto'"
                    )));
                }
            }
            repos.extend(new.repos);
            repos = self.resolve_repo_definitions(repo, &repos)?;

            for name in new.environments.keys() {
                if environments.contains_key(name) || repos.contains_key(name) {
                    return Err(ResolveError::resolution(format!(
                        "Name {name} can't be defined a second time in include {inc_repo}/{inc_hash}/{inc_path}"
                    )));
                }
            }
            environments.extend(new.environments);

            for name in new.tests.keys() {
                if tests.contains_key(name)
                    || environments.contains_key(name)
                    || repos.contains_key(name)
                {
                    return Err(ResolveError::resolution(format!(
                        "Name {name} can't be defined a second time in include {inc_repo}/{inc_hash}/{inc_path}"
                    )));
                }
            }
            tests.extend(new.tests);

            for nested in new.includes {
                queue.push_back((
                    inc_repo.clone(),
                    inc_hash.clone(),
                    inc_path.clone(),
                    nested,
                ));
            }
        }

        // Prioritization globs in the root file narrow the enabled set.
        if !parsed.prioritize_globs.is_empty() {
            for (name, test) in tests.iter_mut() {
                if !parsed.prioritize_globs.iter().any(|g| glob_match(g, name)) {
                    test.disabled = true;
                }
            }
        }

        let post = PostIncludeDefinitions {
            tests,
            environments,
            repos,
        };
        self.post_include_cache.insert(key, post.clone());
        Ok(post)
    }

    // -----------------------------------------------------------------
    // Stage 4: environments
    // -----------------------------------------------------------------

    pub fn environments_for(
        &mut self,
        repo: &str,
        hash: &str,
    ) -> Result<BTreeMap<String, ResolvedEnvironment>, ResolveError> {
        let key = (repo.to_string(), hash.to_string());
        if let Some(envs) = self.environment_cache.get(&key) {
            return Ok(envs.clone());
        }

        let post = self.post_include_definitions(repo, hash)?;
        let resolved_repos = post.repos;
        let mut environments = post.environments;

        // Synthesize an import environment per mixin combination in use.
        for test in post.tests.values() {
            if test.environment_mixins.is_empty() {
                continue;
            }
            let synthetic = actual_environment_name(test);
            let mut imports = vec![test.environment_name.clone()];
            imports.extend(test.environment_mixins.iter().cloned());
            environments
                .entry(synthetic)
                .or_insert(ParsedEnvironment::Import {
                    imports,
                    body: EnvBody::default(),
                });
        }

        let mut done = BTreeMap::new();
        let names: Vec<String> = environments.keys().cloned().collect();
        for name in names {
            self.resolve_environment_in(
                repo,
                hash,
                &name,
                &environments,
                &resolved_repos,
                &mut done,
                &mut Vec::new(),
            )?;
        }

        self.environment_cache.insert(key, done.clone());
        Ok(done)
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_environment_in(
        &mut self,
        repo: &str,
        hash: &str,
        name: &str,
        environments: &BTreeMap<String, ParsedEnvironment>,
        resolved_repos: &BTreeMap<String, RepoReference>,
        done: &mut BTreeMap<String, ResolvedEnvironment>,
        in_progress: &mut Vec<String>,
    ) -> Result<ResolvedEnvironment, ResolveError> {
        if let Some(env) = done.get(name) {
            return Ok(env.clone());
        }
        if in_progress.iter().any(|n| n == name) {
            let mut chain = in_progress.clone();
            chain.push(name.to_string());
            return Err(ResolveError::resolution(format!(
                "Circular environment dependency found: {}",
                chain.join(" -> ")
            )));
        }

        let Some(environment) = environments.get(name).cloned() else {
            return Err(ResolveError::resolution(format!(
                "Can't find environment {name} in {repo}/{hash}. Available: {}",
                environments
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(",")
            )));
        };

        in_progress.push(name.to_string());

        let resolved = match environment {
            ParsedEnvironment::Environment {
                platform,
                image,
                body,
            } => {
                let image = self.resolve_image(repo, hash, image)?;
                let dependencies = self.resolve_env_dependencies(body.dependencies.clone(), resolved_repos)?;
                build_resolved_environment(platform, image, body, dependencies)
            }
            ParsedEnvironment::Import { imports, body } => {
                let mut bases = Vec::new();
                for import in &imports {
                    match import.split_once('/') {
                        Some((ref_name, env_name)) if resolved_repos.contains_key(ref_name) => {
                            let reference = &resolved_repos[ref_name];
                            let other = self
                                .environments_for(reference.reponame(), reference.commit_hash())?;
                            let Some(base) = other.get(env_name) else {
                                return Err(ResolveError::resolution(format!(
                                    "Can't find environment {env_name} for {}/{}. Available: {}",
                                    reference.reponame(),
                                    reference.commit_hash(),
                                    other.keys().cloned().collect::<Vec<_>>().join(",")
                                )));
                            };
                            bases.push(base.clone());
                        }
                        _ => {
                            bases.push(self.resolve_environment_in(
                                repo,
                                hash,
                                import,
                                environments,
                                resolved_repos,
                                done,
                                in_progress,
                            )?);
                        }
                    }
                }
                let dependencies = self.resolve_env_dependencies(body.dependencies.clone(), resolved_repos)?;
                merge_environments(name, bases, body, dependencies)?
            }
        };

        in_progress.pop();

        let resolved = apply_environment_substitutions(resolved);
        done.insert(name.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Inline a dockerfile image from the defining commit's tree.
    fn resolve_image(&self, repo: &str, hash: &str, image: Image) -> Result<Image, ResolveError> {
        match image {
            Image::Dockerfile {
                repo: image_repo,
                commit_hash,
                path,
            } => {
                let (repo, hash) = if image_repo.is_empty() {
                    (repo.to_string(), hash.to_string())
                } else {
                    (image_repo, commit_hash)
                };
                let contents = self.contents_at(&repo, &hash, &path)?.ok_or_else(|| {
                    ResolveError::resolution(format!(
                        "Can't find dockerfile {path} in {repo}/{hash}"
                    ))
                })?;
                Ok(Image::DockerfileInline { contents })
            }
            other => Ok(other),
        }
    }

    /// Rewrite source dependencies to concrete `(repo, hash)` pairs,
    /// substituting subpath history where declared. Build dependencies are
    /// left for the test stage.
    fn resolve_env_dependencies(
        &mut self,
        dependencies: BTreeMap<String, TestDependency>,
        resolved_repos: &BTreeMap<String, RepoReference>,
    ) -> Result<BTreeMap<String, TestDependency>, ResolveError> {
        let mut out = BTreeMap::new();
        for (expose_as, dep) in dependencies {
            out.insert(expose_as, self.resolve_source_dep(dep, resolved_repos)?);
        }
        Ok(out)
    }

    fn resolve_source_dep(
        &mut self,
        dep: TestDependency,
        resolved_repos: &BTreeMap<String, RepoReference>,
    ) -> Result<TestDependency, ResolveError> {
        match dep {
            TestDependency::UnresolvedSource { repo_name, path } => {
                let Some(reference) = resolved_repos.get(&repo_name) else {
                    return Err(ResolveError::resolution(format!(
                        "depends on unknown reponame: {repo_name}"
                    )));
                };
                let repo = reference.reponame().to_string();
                let base = reference.commit_hash().to_string();
                let commit_hash = match &path {
                    Some(subpath) => self.most_recent_hash_for_subpath(&repo, &base, subpath)?,
                    None => base,
                };
                Ok(TestDependency::Source {
                    repo,
                    commit_hash,
                    path,
                })
            }
            TestDependency::Source {
                repo,
                commit_hash,
                path: Some(subpath),
            } => {
                let real = self.most_recent_hash_for_subpath(&repo, &commit_hash, &subpath)?;
                Ok(TestDependency::Source {
                    repo,
                    commit_hash: real,
                    path: Some(subpath),
                })
            }
            other => Ok(other),
        }
    }

    fn most_recent_hash_for_subpath(
        &self,
        repo: &str,
        base_hash: &str,
        path: &str,
    ) -> Result<String, ResolveError> {
        let git = (self.git_repo_lookup)(repo).ok_or_else(|| ResolveError::missing_repo(repo))?;
        if !git.commit_exists(base_hash) {
            return Err(ResolveError::missing_commit(repo, base_hash));
        }
        git.most_recent_hash_for_subpath(base_hash, path)
            .map_err(|e| {
                ResolveError::resolution(format!(
                    "can't find history for {path:?} in {repo}/{base_hash}: {e}"
                ))
            })
    }

    // -----------------------------------------------------------------
    // Stage 5: tests
    // -----------------------------------------------------------------

    pub fn test_definitions_for(
        &mut self,
        repo: &str,
        hash: &str,
    ) -> Result<BTreeMap<String, TestDefinition>, ResolveError> {
        let key = (repo.to_string(), hash.to_string());
        if let Some(tests) = self.test_cache.get(&key) {
            return Ok(tests.clone());
        }

        let post = self.post_include_definitions(repo, hash)?;
        let resolved_repos = post.repos.clone();
        let resolved_envs = self.environments_for(repo, hash)?;

        // Apply each test's (possibly synthetic) environment.
        let mut tests: BTreeMap<String, TestDefinition> = BTreeMap::new();
        for (name, parsed) in &post.tests {
            let env_name = actual_environment_name(parsed);
            let Some(environment) = resolved_envs.get(&env_name) else {
                return Err(ResolveError::resolution(format!(
                    "Can't find environment {} (referenced by {}) in {}",
                    parsed.environment_name,
                    parsed.name,
                    resolved_envs.keys().cloned().collect::<Vec<_>>().join(",")
                )));
            };
            tests.insert(
                name.clone(),
                apply_environment_to_test(parsed.clone(), environment.clone()),
            );
        }

        assert_tests_noncircular(&tests)?;
        ensure_enabled_children(&mut tests)?;

        let mut resolved: BTreeMap<String, TestDefinition> = BTreeMap::new();
        let names: Vec<String> = tests.keys().cloned().collect();
        for name in names {
            self.resolve_test(repo, hash, &name, &tests, &resolved_repos, &mut resolved)?;
        }

        self.test_cache.insert(key, resolved.clone());
        Ok(resolved)
    }

    fn resolve_test(
        &mut self,
        repo: &str,
        hash: &str,
        name: &str,
        tests: &BTreeMap<String, TestDefinition>,
        resolved_repos: &BTreeMap<String, RepoReference>,
        resolved: &mut BTreeMap<String, TestDefinition>,
    ) -> Result<TestDefinition, ResolveError> {
        if let Some(test) = resolved.get(name) {
            return Ok(test.clone());
        }

        let Some(test) = tests.get(name) else {
            return Err(ResolveError::resolution(format!(
                "Can't find build {name} in {}",
                tests.keys().cloned().collect::<Vec<_>>().join(",")
            )));
        };
        let mut test = test.clone();

        assert_artifact_set_valid(&test)?;

        let dep_names: Vec<String> = test.dependencies.keys().cloned().collect();
        for dep_name in dep_names {
            let dep = test.dependencies[&dep_name].clone();
            let rewritten =
                self.resolve_test_dep(repo, hash, name, dep, tests, resolved_repos, resolved)?;
            test.dependencies.insert(dep_name, rewritten);
        }

        test.stages = sort_test_stages(test.stages);
        test.hash = test.content_hash();

        resolved.insert(name.to_string(), test.clone());
        Ok(test)
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_test_dep(
        &mut self,
        repo: &str,
        hash: &str,
        owner: &str,
        dep: TestDependency,
        tests: &BTreeMap<String, TestDefinition>,
        resolved_repos: &BTreeMap<String, RepoReference>,
        resolved: &mut BTreeMap<String, TestDefinition>,
    ) -> Result<TestDependency, ResolveError> {
        match dep {
            TestDependency::InternalBuild { name } => {
                let (build_name, artifact) =
                    resolve_test_name_to_test_and_artifact(&name, tests, false).map_err(|e| {
                        ResolveError::resolution(format!("While processing test {owner}:\n{e}"))
                    })?;
                let build =
                    self.resolve_test(repo, hash, &build_name, tests, resolved_repos, resolved)?;
                Ok(TestDependency::Build {
                    build_hash: build.hash,
                    name: build_name,
                    artifact,
                })
            }
            TestDependency::ExternalBuild {
                repo: ext_repo,
                commit_hash,
                name,
            } => {
                let external = self.test_definitions_for(&ext_repo, &commit_hash)?;
                let (build_name, artifact) =
                    resolve_test_name_to_test_and_artifact(&name, &external, false).map_err(
                        |e| {
                            ResolveError::resolution(format!(
                                "While processing test {owner}:\n{e}"
                            ))
                        },
                    )?;
                Ok(TestDependency::Build {
                    build_hash: external[&build_name].hash.clone(),
                    name: build_name,
                    artifact,
                })
            }
            TestDependency::UnresolvedExternalBuild { repo_name, name } => {
                let Some(reference) = resolved_repos.get(&repo_name) else {
                    return Err(ResolveError::resolution(format!(
                        "Test depends on unknown reponame: {repo_name}"
                    )));
                };
                self.resolve_test_dep(
                    repo,
                    hash,
                    owner,
                    TestDependency::ExternalBuild {
                        repo: reference.reponame().to_string(),
                        commit_hash: reference.commit_hash().to_string(),
                        name,
                    },
                    tests,
                    resolved_repos,
                    resolved,
                )
            }
            source_like => self.resolve_source_dep(source_like, resolved_repos),
        }
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

fn extension_of(path: &str) -> String {
    match path.rfind('.') {
        Some(pos) => path[pos..].to_string(),
        None => String::new(),
    }
}

/// Synthetic environment name for a test with mixins: `env+m1+m2`.
fn actual_environment_name(test: &ParsedTest) -> String {
    if test.environment_mixins.is_empty() {
        test.environment_name.clone()
    } else {
        let mut parts = vec![test.environment_name.clone()];
        parts.extend(test.environment_mixins.iter().cloned());
        parts.join("+")
    }
}

/// Resolve an include path to `(repo, hash, path)`.
///
/// Syntax: leading `/` is the defining repo's root; `./`/`../` are relative
/// to the defining file; a leading repo-reference name targets that repo.
fn resolve_include_string(
    repos: &BTreeMap<String, RepoReference>,
    def_repo: &str,
    def_hash: &str,
    def_path: &str,
    include_path: &str,
) -> Result<(String, String, String), ResolveError> {
    let items: Vec<&str> = include_path.split('/').collect();
    let first = items[0];

    if first.is_empty() {
        return Ok((
            def_repo.to_string(),
            def_hash.to_string(),
            items[1..].join("/"),
        ));
    }

    if first == "." || first == ".." {
        let base = format!("{def_path}/../{include_path}");
        return Ok((def_repo.to_string(), def_hash.to_string(), normalize_path(&base)));
    }

    if let Some(reference) = repos.get(first) {
        return Ok((
            reference.reponame().to_string(),
            reference.commit_hash().to_string(),
            items[1..].join("/"),
        ));
    }

    Err(ResolveError::resolution(format!(
        "Invalid include {include_path}: should start with a repo, a '/' (for root of current repo), '.', or '..'"
    )))
}

/// Resolve `.` and `..` segments in a slash path; platform-independent on
/// purpose (these are git tree paths, not filesystem paths).
fn normalize_path(path: &str) -> String {
    let mut items: Vec<&str> = path.split('/').collect();
    let mut i = 0;
    while i < items.len() {
        if items[i] == "." {
            items.remove(i);
        } else if items[i] == ".." && i > 0 {
            items.remove(i - 1);
            items.remove(i - 1);
            i -= 1;
        } else {
            i += 1;
        }
    }
    items.join("/")
}

fn build_resolved_environment(
    platform: Platform,
    image: Image,
    body: EnvBody,
    dependencies: BTreeMap<String, TestDependency>,
) -> ResolvedEnvironment {
    ResolvedEnvironment {
        platform,
        image,
        variables: body.variables,
        dependencies,
        setup_script_contents: body.setup_script_contents,
        test_configuration: body.test_configuration.unwrap_or_default(),
        test_stages: body.test_stages,
        test_timeout: body.test_timeout.unwrap_or(0),
        test_min_cores: body.test_min_cores.unwrap_or(0),
        test_max_cores: body.test_max_cores.unwrap_or(0),
        test_min_ram_gb: body.test_min_ram_gb.unwrap_or(0),
        test_min_disk_gb: body.test_min_disk_gb.unwrap_or(0),
        test_max_retries: body.test_max_retries.unwrap_or(0),
        test_retry_wait_seconds: body.test_retry_wait_seconds.unwrap_or(0),
    }
}

/// Merge imported environments under an overlay body. Later imports
/// override earlier ones; the overlay overrides everything. Platform and
/// image come from the first import (imports can't change platform).
fn merge_environments(
    name: &str,
    bases: Vec<ResolvedEnvironment>,
    overlay: EnvBody,
    overlay_dependencies: BTreeMap<String, TestDependency>,
) -> Result<ResolvedEnvironment, ResolveError> {
    let Some(first) = bases.first() else {
        return Err(ResolveError::resolution(format!(
            "environment {name} imports nothing concrete"
        )));
    };

    let mut variables = BTreeMap::new();
    let mut dependencies = BTreeMap::new();
    let mut stages = Vec::new();
    let mut setup_scripts = Vec::new();
    let mut configuration = String::new();
    let mut timeout = 0;
    let mut min_cores = 0;
    let mut max_cores = 0;
    let mut min_ram_gb = 0;
    let mut min_disk_gb = 0;
    let mut max_retries = 0;
    let mut retry_wait = 0;

    for base in &bases {
        variables.extend(base.variables.clone());
        dependencies.extend(base.dependencies.clone());
        stages.extend(base.test_stages.clone());
        if !base.setup_script_contents.is_empty() {
            setup_scripts.push(base.setup_script_contents.clone());
        }
        if !base.test_configuration.is_empty() {
            configuration = base.test_configuration.clone();
        }
        if base.test_timeout != 0 {
            timeout = base.test_timeout;
        }
        if base.test_min_cores != 0 {
            min_cores = base.test_min_cores;
        }
        if base.test_max_cores != 0 {
            max_cores = base.test_max_cores;
        }
        if base.test_min_ram_gb != 0 {
            min_ram_gb = base.test_min_ram_gb;
        }
        if base.test_min_disk_gb != 0 {
            min_disk_gb = base.test_min_disk_gb;
        }
        if base.test_max_retries != 0 {
            max_retries = base.test_max_retries;
        }
        if base.test_retry_wait_seconds != 0 {
            retry_wait = base.test_retry_wait_seconds;
        }
    }

    variables.extend(overlay.variables);
    dependencies.extend(overlay_dependencies);
    stages.extend(overlay.test_stages);
    if !overlay.setup_script_contents.is_empty() {
        setup_scripts.push(overlay.setup_script_contents);
    }

    Ok(ResolvedEnvironment {
        platform: first.platform,
        image: first.image.clone(),
        variables,
        dependencies,
        setup_script_contents: setup_scripts.join("\n"),
        test_configuration: overlay.test_configuration.unwrap_or(configuration),
        test_stages: stages,
        test_timeout: overlay.test_timeout.unwrap_or(timeout),
        test_min_cores: overlay.test_min_cores.unwrap_or(min_cores),
        test_max_cores: overlay.test_max_cores.unwrap_or(max_cores),
        test_min_ram_gb: overlay.test_min_ram_gb.unwrap_or(min_ram_gb),
        test_min_disk_gb: overlay.test_min_disk_gb.unwrap_or(min_disk_gb),
        test_max_retries: overlay.test_max_retries.unwrap_or(max_retries),
        test_retry_wait_seconds: overlay.test_retry_wait_seconds.unwrap_or(retry_wait),
    })
}

/// Fixpoint-substitute the environment's variables into themselves.
fn apply_environment_substitutions(mut env: ResolvedEnvironment) -> ResolvedEnvironment {
    env.variables = substitute_map(&env.variables);
    for stage in &mut env.test_stages {
        substitute_stage(stage, &env.variables);
    }
    env
}

fn substitute_stage(stage: &mut Stage, vars: &BTreeMap<String, String>) {
    stage.command = substitute(&stage.command, vars);
    stage.cleanup = substitute(&stage.cleanup, vars);
    for artifact in &mut stage.artifacts {
        artifact.name = substitute(&artifact.name, vars);
        artifact.directory = substitute(&artifact.directory, vars);
    }
}

/// Apply the resolved environment to a parsed test, producing the
/// (unhashed) test definition: merged variables, dependencies, stages, and
/// resource defaults, with variable substitution over commands and
/// artifact paths.
fn apply_environment_to_test(test: ParsedTest, environment: ResolvedEnvironment) -> TestDefinition {
    let mut variables = environment.variables.clone();
    variables.extend(test.variables);
    let variables = substitute_map(&variables);

    let mut dependencies = environment.dependencies.clone();
    dependencies.extend(test.dependencies);

    let mut stages = environment.test_stages.clone();
    stages.extend(test.stages);
    for stage in &mut stages {
        substitute_stage(stage, &variables);
    }

    let configuration = test
        .configuration
        .map(|c| substitute(&c, &variables))
        .unwrap_or_else(|| {
            if environment.test_configuration.is_empty() {
                match environment.platform {
                    Platform::Linux => "linux".to_string(),
                    Platform::Windows => "windows".to_string(),
                }
            } else {
                environment.test_configuration.clone()
            }
        });

    TestDefinition {
        name: test.name,
        kind: test.kind,
        environment_name: test.environment_name,
        environment_mixins: test.environment_mixins,
        dependencies,
        variables,
        stages,
        configuration,
        project: test.project,
        disabled: test.disabled,
        timeout: test
            .timeout
            .or(nonzero_u64(environment.test_timeout))
            .unwrap_or(DEFAULT_TIMEOUT),
        min_cores: test
            .min_cores
            .or(nonzero_u32(environment.test_min_cores))
            .unwrap_or(0),
        max_cores: test
            .max_cores
            .or(nonzero_u32(environment.test_max_cores))
            .unwrap_or(0),
        min_ram_gb: test
            .min_ram_gb
            .or(nonzero_u32(environment.test_min_ram_gb))
            .unwrap_or(0),
        min_disk_gb: test
            .min_disk_gb
            .or(nonzero_u32(environment.test_min_disk_gb))
            .unwrap_or(0),
        max_retries: test
            .max_retries
            .or(nonzero_u32(environment.test_max_retries))
            .unwrap_or(0),
        retry_wait_seconds: test
            .retry_wait_seconds
            .or(nonzero_u64(environment.test_retry_wait_seconds))
            .unwrap_or(0),
        environment,
        hash: String::new(),
    }
}

fn nonzero_u64(v: u64) -> Option<u64> {
    if v == 0 { None } else { Some(v) }
}

fn nonzero_u32(v: u32) -> Option<u32> {
    if v == 0 { None } else { Some(v) }
}

/// Resolve `"test/artifact"` against a test set: the shortest test-name
/// prefix wins, and the remainder must name one of its artifacts.
pub fn resolve_test_name_to_test_and_artifact(
    name: &str,
    tests: &BTreeMap<String, TestDefinition>,
    ignore_artifact_resolution: bool,
) -> Result<(String, String), String> {
    let parts: Vec<&str> = name.split('/').collect();
    for i in 0..=parts.len() {
        let candidate = parts[..i].join("/");
        if let Some(test) = tests.get(&candidate) {
            let artifact = parts[i..].join("/");
            if !ignore_artifact_resolution {
                let valid: HashSet<&str> = test
                    .stages
                    .iter()
                    .flat_map(|s| s.artifacts.iter().map(|a| a.name.as_str()))
                    .collect();
                if !valid.contains(artifact.as_str()) {
                    let mut sorted: Vec<&&str> = valid.iter().collect();
                    sorted.sort();
                    return Err(format!(
                        "Can't resolve artifact '{artifact}' in test {candidate}. Valid are {sorted:?}."
                    ));
                }
            }
            return Ok((candidate, artifact));
        }
    }
    let mut available: Vec<&String> = tests.keys().collect();
    available.sort();
    Err(format!(
        "Can't resolve {name} to a valid name amongst: {available:?}"
    ))
}

/// Reject cyclic internal-build dependencies with an explicit DFS (the
/// commit graph can be arbitrarily deep, test graphs cannot recurse).
fn assert_tests_noncircular(tests: &BTreeMap<String, TestDefinition>) -> Result<(), ResolveError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: BTreeMap<String, Mark> = BTreeMap::new();

    for root in tests.keys() {
        if marks.contains_key(root) {
            continue;
        }
        // Explicit stack: (name, next child index).
        let mut stack: Vec<(String, Vec<String>, usize)> = Vec::new();
        let children = internal_build_children(root, tests);
        marks.insert(root.clone(), Mark::Visiting);
        stack.push((root.clone(), children, 0));

        while let Some((name, children, idx)) = stack.last_mut() {
            if *idx >= children.len() {
                marks.insert(name.clone(), Mark::Done);
                stack.pop();
                continue;
            }
            let child = children[*idx].clone();
            *idx += 1;
            match marks.get(&child) {
                Some(Mark::Visiting) => {
                    let mut chain: Vec<String> =
                        stack.iter().map(|(n, _, _)| n.clone()).collect();
                    chain.push(child);
                    return Err(ResolveError::resolution(format!(
                        "Circular test dependency found: {}",
                        chain.join(" -> ")
                    )));
                }
                Some(Mark::Done) => {}
                None => {
                    let grandchildren = internal_build_children(&child, tests);
                    marks.insert(child.clone(), Mark::Visiting);
                    stack.push((child, grandchildren, 0));
                }
            }
        }
    }
    Ok(())
}

fn internal_build_children(name: &str, tests: &BTreeMap<String, TestDefinition>) -> Vec<String> {
    let Some(test) = tests.get(name) else {
        return vec![];
    };
    test.dependencies
        .values()
        .filter_map(|dep| match dep {
            TestDependency::InternalBuild { name } => {
                resolve_test_name_to_test_and_artifact(name, tests, true)
                    .ok()
                    .map(|(n, _)| n)
            }
            _ => None,
        })
        .collect()
}

/// Any internally-defined build an enabled test depends on must itself be
/// enabled.
fn ensure_enabled_children(tests: &mut BTreeMap<String, TestDefinition>) -> Result<(), ResolveError> {
    let mut frontier: Vec<String> = tests
        .iter()
        .filter(|(_, t)| !t.disabled)
        .map(|(n, _)| n.clone())
        .collect();

    while let Some(name) = frontier.pop() {
        for child in internal_build_children(&name, tests) {
            if let Some(test) = tests.get_mut(&child) {
                if test.disabled {
                    test.disabled = false;
                    frontier.push(child);
                }
            }
        }
    }
    Ok(())
}

/// Stable sort of stages by declared order.
fn sort_test_stages(stages: Vec<Stage>) -> Vec<Stage> {
    let mut sorted = stages;
    sorted.sort_by_key(|s| s.order);
    sorted
}

/// No duplicate artifact names; the unnamed artifact cannot coexist with
/// named ones.
fn assert_artifact_set_valid(test: &TestDefinition) -> Result<(), ResolveError> {
    let mut seen = HashSet::new();
    for stage in &test.stages {
        for artifact in &stage.artifacts {
            if !seen.insert(artifact.name.clone()) {
                if artifact.name.is_empty() {
                    return Err(ResolveError::resolution(format!(
                        "Test {} defined the unnamed artifact twice. Check whether a naked \
                         'command' exists in the build definition, since that implies a global \
                         artifact of the entire build output directory",
                        test.name
                    )));
                }
                return Err(ResolveError::resolution(format!(
                    "Test {} defined artifact {:?} twice",
                    test.name, artifact.name
                )));
            }
        }
    }
    if seen.contains("") && seen.len() > 1 {
        return Err(ResolveError::resolution(format!(
            "Test {} can only define the unnamed artifact if it defines no others",
            test.name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_relative_paths() {
        assert_eq!(normalize_path("a/b/../c"), "a/c");
        assert_eq!(normalize_path("./a/./b"), "a/b");
        assert_eq!(normalize_path("ci/defs.yml/../common.yml"), "ci/common.yml");
    }

    #[test]
    fn stage_sort_is_stable() {
        let stages = vec![
            Stage {
                command: "b".into(),
                order: 1,
                ..Default::default()
            },
            Stage {
                command: "a".into(),
                order: 0,
                ..Default::default()
            },
            Stage {
                command: "c".into(),
                order: 1,
                ..Default::default()
            },
        ];
        let sorted = sort_test_stages(stages);
        let commands: Vec<&str> = sorted.iter().map(|s| s.command.as_str()).collect();
        assert_eq!(commands, vec!["a", "b", "c"]);
    }
}
