//! Daemon configuration, loaded from `~/.config/v2ci/config.yml`.
//!
//! The file is parsed into a raw serde layer mirroring the YAML schema and
//! then validated into the domain types below, with derived paths filled
//! in. Everything is immutable after load; the only later mutation is the
//! supervisor removing architectures whose chroot bootstrap failed before
//! forking a worker.
//!
//! ```yaml
//! build_dir: /home/ci/v2ci-build
//! projects:
//!   - name: sshlirp
//!     target_dir: /home/ci/binaries/sshlirp
//!     git:
//!       repo_url: https://github.com/virtualsquare/sshlirp.git
//!     build-config:
//!       build_mode: full
//!       poll_interval: 180
//!     architectures: [amd64, arm64]
//!     source:
//!       dependencies: [gcc, make]
//!       main_repo:
//!         build_system: cmake
//!       dependency_repos:
//!         - git_url: https://github.com/virtualsquare/libslirp.git
//!           build_system: meson
//!           dependencies: [meson, ninja-build]
//!     binaries-limits:
//!       weekly_mem_limit: 500
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::paths;

/// Upper bound on architectures per project (and on their union).
pub const MAX_ARCHITECTURES: usize = 9;
/// Upper bound on packages per list and on manual dependencies per project.
pub const MAX_DEPENDENCIES: usize = 16;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 180;
const DEFAULT_ARCHITECTURES: [&str; 4] = ["amd64", "arm64", "armhf", "riscv64"];
const MAX_ARCH_NAME_LEN: usize = 63;

/// Which repositories trigger a rebuild when they change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Only the main repository is watched.
    Main,
    /// Only the manual dependency repositories are watched.
    Dep,
    /// The main repository first; the dependencies only when it is current.
    Full,
}

impl BuildMode {
    /// The update check consults the main repository.
    pub fn checks_main(self) -> bool {
        matches!(self, BuildMode::Main | BuildMode::Full)
    }
}

impl FromStr for BuildMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "main" => Ok(BuildMode::Main),
            "dep" => Ok(BuildMode::Dep),
            "full" => Ok(BuildMode::Full),
            other => bail!("unknown build_mode '{other}' (expected main, dep or full)"),
        }
    }
}

impl std::fmt::Display for BuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BuildMode::Main => "main",
            BuildMode::Dep => "dep",
            BuildMode::Full => "full",
        })
    }
}

/// Size and age limits handed to the nightly binaries-rotation cronjob.
///
/// Memory limits are in MB, aging intervals in minutes. The daily interval
/// is the project's `poll_interval` and therefore not stored here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinariesLimits {
    pub daily_mem_limit: u64,
    pub weekly_mem_limit: u64,
    pub monthly_mem_limit: u64,
    pub yearly_mem_limit: u64,
    pub weekly_interval: u64,
    pub monthly_interval: u64,
    pub yearly_interval: u64,
}

/// A repository that must be cloned and built before the main project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManualDependency {
    pub git_url: String,
    pub build_system: String,
    /// Packages to install before building this dependency.
    pub dependencies: Vec<String>,
}

/// One configured project, owned by exactly one worker process after fork.
#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    /// Where finished binaries land on the host. Absolute.
    pub target_dir: PathBuf,
    pub repo_url: String,
    pub main_build_system: String,
    pub build_mode: BuildMode,
    pub poll_interval: Duration,
    /// Unique, in declared order, at most [`MAX_ARCHITECTURES`].
    pub architectures: Vec<String>,
    /// Packages to install before building the main project.
    pub dependency_packages: Vec<String>,
    /// Ordered: dependencies are cloned and built in this order.
    pub manual_dependencies: Vec<ManualDependency>,
    pub binaries_limits: BinariesLimits,

    // Derived paths.
    /// `<build_dir>/<name>`
    pub main_project_build_dir: PathBuf,
    /// `<main_project_build_dir>/logs/worker.log`
    pub worker_log_file: PathBuf,
    /// `<main_project_build_dir>/logs/binaries_rotation_cronjob.log`
    pub cronjob_log_file: PathBuf,
}

impl Project {
    pub fn poll_secs(&self) -> u64 {
        self.poll_interval.as_secs()
    }
}

/// Root configuration value.
#[derive(Debug, Clone)]
pub struct Config {
    pub build_dir: PathBuf,
    /// `<build_dir>/logs/main.log`
    pub main_log_file: PathBuf,
    pub projects: Vec<Project>,
}

impl Config {
    /// Load from the default location, tilde-expanded from `$HOME`.
    pub fn load() -> Result<Self> {
        let path = paths::expand_tilde(paths::DEFAULT_CONFIG_PATH)?;
        Self::load_from(&path)
    }

    /// Load and validate the file at `path`.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("unable to open config file at {}", path.display()))?;
        Self::from_yaml(&text)
            .with_context(|| format!("unable to parse config file at {}", path.display()))
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(text).context("malformed YAML")?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        if !raw.build_dir.is_absolute() {
            bail!("build_dir must be an absolute path");
        }
        if raw.projects.is_empty() {
            bail!("no projects found in configuration file");
        }
        let main_log_file = raw.build_dir.join("logs").join("main.log");
        let projects = raw
            .projects
            .into_iter()
            .map(|p| Project::from_raw(p, &raw.build_dir))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            build_dir: raw.build_dir,
            main_log_file,
            projects,
        })
    }
}

impl Project {
    fn from_raw(raw: RawProject, build_dir: &Path) -> Result<Self> {
        if raw.name.is_empty() {
            bail!("project with empty name");
        }
        let name = raw.name;
        if !raw.target_dir.is_absolute() {
            bail!("target_dir for project {name} must be an absolute path");
        }

        // source.main_repo.git_url overrides git.repo_url when both appear.
        let main_repo = raw
            .source
            .main_repo
            .with_context(|| format!("project {name} is missing source.main_repo"))?;
        let repo_url = main_repo
            .git_url
            .or(raw.git.map(|g| g.repo_url))
            .with_context(|| {
                format!("project {name} declares no repository URL (git.repo_url or source.main_repo.git_url)")
            })?;

        let build_mode = match raw.build_config.build_mode {
            Some(mode) => mode.parse().with_context(|| format!("project {name}"))?,
            None => BuildMode::Full,
        };
        let poll_interval = Duration::from_secs(
            raw.build_config
                .poll_interval
                .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        );

        let declared = if raw.architectures.is_empty() {
            DEFAULT_ARCHITECTURES.iter().map(|a| a.to_string()).collect()
        } else {
            raw.architectures
        };
        let mut architectures: Vec<String> = Vec::new();
        for arch in declared {
            if arch.len() > MAX_ARCH_NAME_LEN {
                bail!("architecture name '{arch}' for project {name} is too long");
            }
            if !architectures.contains(&arch) {
                architectures.push(arch);
            }
        }
        let architectures = capped(architectures, MAX_ARCHITECTURES, "architectures", &name);

        let dependency_packages = capped(
            raw.source.dependencies,
            MAX_DEPENDENCIES,
            "source.dependencies",
            &name,
        );
        let manual_dependencies = capped(
            raw.source.dependency_repos,
            MAX_DEPENDENCIES,
            "source.dependency_repos",
            &name,
        )
        .into_iter()
        .map(|dep| ManualDependency {
            dependencies: capped(dep.dependencies, MAX_DEPENDENCIES, "dependencies", &name),
            git_url: dep.git_url,
            build_system: dep.build_system,
        })
        .collect();

        let main_project_build_dir = build_dir.join(&name);
        let logs_dir = main_project_build_dir.join("logs");
        Ok(Self {
            worker_log_file: logs_dir.join("worker.log"),
            cronjob_log_file: logs_dir.join("binaries_rotation_cronjob.log"),
            main_project_build_dir,
            target_dir: raw.target_dir,
            repo_url,
            main_build_system: main_repo.build_system,
            build_mode,
            poll_interval,
            architectures,
            dependency_packages,
            manual_dependencies,
            binaries_limits: raw.binaries_limits.into(),
            name,
        })
    }
}

/// Drop entries beyond `max`, keeping declared order. Exceeding a cap is
/// not fatal; the extras are ignored with a logged error on stderr (this
/// runs before daemonization).
fn capped<T>(mut values: Vec<T>, max: usize, what: &str, project: &str) -> Vec<T> {
    if values.len() > max {
        eprintln!(
            "Error: {what} for project {project} exceeds the limit of {max}; ignoring {} extra entries",
            values.len() - max
        );
        values.truncate(max);
    }
    values
}

// ── Raw serde layer (YAML schema) ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawConfig {
    build_dir: PathBuf,
    #[serde(default)]
    projects: Vec<RawProject>,
}

#[derive(Debug, Deserialize)]
struct RawProject {
    name: String,
    target_dir: PathBuf,
    #[serde(default)]
    git: Option<RawGit>,
    #[serde(rename = "build-config", default)]
    build_config: RawBuildConfig,
    #[serde(default)]
    architectures: Vec<String>,
    #[serde(default)]
    source: RawSource,
    #[serde(rename = "binaries-limits", default)]
    binaries_limits: RawBinariesLimits,
}

#[derive(Debug, Deserialize)]
struct RawGit {
    repo_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawBuildConfig {
    #[serde(default)]
    build_mode: Option<String>,
    #[serde(default)]
    poll_interval: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSource {
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    main_repo: Option<RawMainRepo>,
    #[serde(default)]
    dependency_repos: Vec<RawDepRepo>,
}

#[derive(Debug, Deserialize)]
struct RawMainRepo {
    #[serde(default)]
    git_url: Option<String>,
    build_system: String,
}

#[derive(Debug, Deserialize)]
struct RawDepRepo {
    git_url: String,
    build_system: String,
    #[serde(default)]
    dependencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawBinariesLimits {
    #[serde(default = "default_daily_mem")]
    daily_mem_limit: u64,
    #[serde(default = "default_weekly_mem")]
    weekly_mem_limit: u64,
    #[serde(default = "default_monthly_mem")]
    monthly_mem_limit: u64,
    #[serde(default = "default_yearly_mem")]
    yearly_mem_limit: u64,
    #[serde(default = "default_weekly_interval")]
    weekly_interval: u64,
    #[serde(default = "default_monthly_interval")]
    monthly_interval: u64,
    #[serde(default = "default_yearly_interval")]
    yearly_interval: u64,
}

fn default_daily_mem() -> u64 {
    100
}
fn default_weekly_mem() -> u64 {
    500
}
fn default_monthly_mem() -> u64 {
    2_000
}
fn default_yearly_mem() -> u64 {
    10_000
}
fn default_weekly_interval() -> u64 {
    10_080
}
fn default_monthly_interval() -> u64 {
    43_200
}
fn default_yearly_interval() -> u64 {
    525_600
}

impl Default for RawBinariesLimits {
    fn default() -> Self {
        Self {
            daily_mem_limit: default_daily_mem(),
            weekly_mem_limit: default_weekly_mem(),
            monthly_mem_limit: default_monthly_mem(),
            yearly_mem_limit: default_yearly_mem(),
            weekly_interval: default_weekly_interval(),
            monthly_interval: default_monthly_interval(),
            yearly_interval: default_yearly_interval(),
        }
    }
}

impl From<RawBinariesLimits> for BinariesLimits {
    fn from(raw: RawBinariesLimits) -> Self {
        Self {
            daily_mem_limit: raw.daily_mem_limit,
            weekly_mem_limit: raw.weekly_mem_limit,
            monthly_mem_limit: raw.monthly_mem_limit,
            yearly_mem_limit: raw.yearly_mem_limit,
            weekly_interval: raw.weekly_interval,
            monthly_interval: raw.monthly_interval,
            yearly_interval: raw.yearly_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config> {
        Config::from_yaml(yaml)
    }

    const FULL_YAML: &str = r#"
build_dir: /tmp/bd
projects:
  - name: p1
    target_dir: /tmp/out
    git:
      repo_url: https://x/y/r-from-git.git
    build-config:
      build_mode: dep
      poll_interval: 30
    architectures: [amd64, arm64, amd64]
    source:
      dependencies: [gcc, make]
      main_repo:
        git_url: https://x/y/r.git
        build_system: cmake
      dependency_repos:
        - git_url: https://x/y/libdep.git
          build_system: meson
          dependencies: [meson]
    binaries-limits:
      weekly_mem_limit: 750
"#;

    #[test]
    fn full_document_parses() {
        let cfg = parse(FULL_YAML).unwrap();
        assert_eq!(cfg.build_dir, PathBuf::from("/tmp/bd"));
        assert_eq!(cfg.main_log_file, PathBuf::from("/tmp/bd/logs/main.log"));

        let p = &cfg.projects[0];
        assert_eq!(p.name, "p1");
        assert_eq!(p.repo_url, "https://x/y/r.git"); // main_repo wins over git
        assert_eq!(p.main_build_system, "cmake");
        assert_eq!(p.build_mode, BuildMode::Dep);
        assert_eq!(p.poll_interval, Duration::from_secs(30));
        assert_eq!(p.architectures, vec!["amd64", "arm64"]); // deduplicated
        assert_eq!(p.dependency_packages, vec!["gcc", "make"]);
        assert_eq!(p.manual_dependencies.len(), 1);
        assert_eq!(p.manual_dependencies[0].build_system, "meson");
        assert_eq!(p.binaries_limits.weekly_mem_limit, 750);
        assert_eq!(p.binaries_limits.daily_mem_limit, 100); // default kept
    }

    #[test]
    fn derived_paths() {
        let cfg = parse(FULL_YAML).unwrap();
        let p = &cfg.projects[0];
        assert_eq!(p.main_project_build_dir, PathBuf::from("/tmp/bd/p1"));
        assert_eq!(
            p.worker_log_file,
            PathBuf::from("/tmp/bd/p1/logs/worker.log")
        );
        assert_eq!(
            p.cronjob_log_file,
            PathBuf::from("/tmp/bd/p1/logs/binaries_rotation_cronjob.log")
        );
    }

    #[test]
    fn minimal_project_gets_defaults() {
        let cfg = parse(
            r#"
build_dir: /tmp/bd
projects:
  - name: p1
    target_dir: /tmp/out
    source:
      main_repo:
        git_url: https://x/y/r.git
        build_system: make
"#,
        )
        .unwrap();
        let p = &cfg.projects[0];
        assert_eq!(p.build_mode, BuildMode::Full);
        assert_eq!(p.poll_interval, Duration::from_secs(180));
        assert_eq!(p.architectures, vec!["amd64", "arm64", "armhf", "riscv64"]);
        assert!(p.dependency_packages.is_empty());
        assert!(p.manual_dependencies.is_empty());
        assert_eq!(p.binaries_limits.yearly_interval, 525_600);
    }

    #[test]
    fn git_repo_url_used_when_main_repo_has_none() {
        let cfg = parse(
            r#"
build_dir: /tmp/bd
projects:
  - name: p1
    target_dir: /tmp/out
    git:
      repo_url: https://x/y/fallback.git
    source:
      main_repo:
        build_system: make
"#,
        )
        .unwrap();
        assert_eq!(cfg.projects[0].repo_url, "https://x/y/fallback.git");
    }

    #[test]
    fn missing_repo_url_is_fatal() {
        let err = parse(
            r#"
build_dir: /tmp/bd
projects:
  - name: p1
    target_dir: /tmp/out
    source:
      main_repo:
        build_system: make
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no repository URL"));
    }

    #[test]
    fn zero_projects_is_fatal() {
        let err = parse("build_dir: /tmp/bd\nprojects: []\n").unwrap_err();
        assert!(err.to_string().contains("no projects"));
    }

    #[test]
    fn relative_build_dir_is_fatal() {
        let err = parse("build_dir: relative/bd\nprojects: []\n").unwrap_err();
        assert!(err.to_string().contains("absolute"));
    }

    #[test]
    fn relative_target_dir_is_fatal() {
        let err = parse(
            r#"
build_dir: /tmp/bd
projects:
  - name: p1
    target_dir: out
    source:
      main_repo:
        git_url: https://x/y/r.git
        build_system: make
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("target_dir"));
    }

    #[test]
    fn unknown_build_mode_is_fatal() {
        let err = parse(
            r#"
build_dir: /tmp/bd
projects:
  - name: p1
    target_dir: /tmp/out
    build-config:
      build_mode: nightly
    source:
      main_repo:
        git_url: https://x/y/r.git
        build_system: make
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("build_mode"));
    }

    #[test]
    fn architectures_capped_at_nine() {
        let archs: Vec<String> = (0..12).map(|i| format!("arch{i}")).collect();
        let yaml = format!(
            r#"
build_dir: /tmp/bd
projects:
  - name: p1
    target_dir: /tmp/out
    architectures: [{}]
    source:
      main_repo:
        git_url: https://x/y/r.git
        build_system: make
"#,
            archs.join(", ")
        );
        let cfg = parse(&yaml).unwrap();
        assert_eq!(cfg.projects[0].architectures.len(), MAX_ARCHITECTURES);
        assert_eq!(cfg.projects[0].architectures[0], "arch0");
    }

    #[test]
    fn dependency_packages_capped_at_sixteen() {
        let pkgs: Vec<String> = (0..20).map(|i| format!("pkg{i}")).collect();
        let yaml = format!(
            r#"
build_dir: /tmp/bd
projects:
  - name: p1
    target_dir: /tmp/out
    source:
      dependencies: [{}]
      main_repo:
        git_url: https://x/y/r.git
        build_system: make
"#,
            pkgs.join(", ")
        );
        let cfg = parse(&yaml).unwrap();
        assert_eq!(cfg.projects[0].dependency_packages.len(), MAX_DEPENDENCIES);
    }

    #[test]
    fn build_mode_round_trips_through_strings() {
        for mode in ["main", "dep", "full"] {
            assert_eq!(mode.parse::<BuildMode>().unwrap().to_string(), mode);
        }
        assert!("other".parse::<BuildMode>().is_err());
    }

    #[test]
    fn load_from_reports_missing_file() {
        let err = Config::load_from(Path::new("/nonexistent/config.yml")).unwrap_err();
        assert!(err.to_string().contains("unable to open config file"));
    }

    #[test]
    fn load_from_reads_a_real_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, FULL_YAML).unwrap();
        let cfg = Config::load_from(&path).unwrap();
        assert_eq!(cfg.projects.len(), 1);
    }
}
