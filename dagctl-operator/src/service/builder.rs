//! Execution unit builder
//!
//! Turns a Run and its Project into the unit definition that performs the
//! work: a source-fetch init step that clones the project into a shared
//! workspace, and a main step that runs the dbt command against it.
//!
//! Construction is deterministic for a given run, project and timestamp.
//! `launch` adds the single side effect: creating the unit under its fixed
//! name, owned by the run.

use chrono::{DateTime, Utc};
use dagctl_core::domain::project::Project;
use dagctl_core::domain::run::Run;
use dagctl_core::domain::unit::{ExecutionUnit, RestartPolicy, Step, UnitSpec, UnitStatus};
use dagctl_core::domain::workload::{EnvFromSource, EnvVar, Volume, VolumeMount, VolumeSource};
use dagctl_core::{ObjectKey, ObjectMeta, Resource};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::info;

use crate::config::UnitDefaults;
use crate::store::{Store, StoreError};

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_PROJECT: &str = "orchestration.dagctl.io/project";
pub const LABEL_RUN: &str = "orchestration.dagctl.io/run";
pub const LABEL_RUN_TYPE: &str = "orchestration.dagctl.io/run-type";
pub const ANNOTATION_COMMAND: &str = "orchestration.dagctl.io/dbt-command";
pub const ANNOTATION_CREATED_AT: &str = "orchestration.dagctl.io/created-at";

const WORKSPACE_VOLUME: &str = "workspace";
const PROFILES_VOLUME: &str = "profiles";
const SSH_VOLUME: &str = "ssh-key";
const CLONE_STEP: &str = "git-clone";
const MAIN_STEP: &str = "dbt";

/// Unit builder errors
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The unit name is taken by an object this run does not control
    #[error("execution unit {unit} exists but is not controlled by run {run}")]
    NameTaken { unit: ObjectKey, run: ObjectKey },

    #[error("run {0} has no uid; it must be persisted before launching")]
    Unpersisted(ObjectKey),
}

pub struct UnitBuilder {
    defaults: UnitDefaults,
}

impl UnitBuilder {
    pub fn new(defaults: UnitDefaults) -> Self {
        Self { defaults }
    }

    /// Run override, then project default, then the built-in verb
    pub fn resolve_commands(&self, run: &Run, project: &Project) -> Vec<String> {
        if !run.spec.commands.is_empty() {
            run.spec.commands.clone()
        } else if !project.spec.commands.is_empty() {
            project.spec.commands.clone()
        } else {
            vec![self.defaults.command.clone()]
        }
    }

    pub fn resolve_image(&self, project: &Project) -> String {
        if project.spec.image.is_empty() {
            self.defaults.image.clone()
        } else {
            project.spec.image.clone()
        }
    }

    pub fn resolve_git_ref(&self, project: &Project) -> String {
        if project.spec.git.reference.is_empty() {
            self.defaults.git_ref.clone()
        } else {
            project.spec.git.reference.clone()
        }
    }

    /// Workspace root joined with the project's sub-path
    pub fn working_dir(&self, project: &Project) -> String {
        let root = self.defaults.workspace_root.trim_end_matches('/');
        let sub_path = project.spec.git.path.trim_matches('/');
        if sub_path.is_empty() {
            root.to_string()
        } else {
            format!("{}/{}", root, sub_path)
        }
    }

    pub fn unit_key(&self, run: &Run) -> ObjectKey {
        ObjectKey::new(
            run.metadata.namespace.clone(),
            format!("{}-{}", run.metadata.name, self.defaults.unit_suffix),
        )
    }

    fn labels(&self, run: &Run, project: &Project) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_NAME.to_string(), "dagctl-dbt".to_string()),
            (LABEL_COMPONENT.to_string(), "dbt-run".to_string()),
            (LABEL_MANAGED_BY.to_string(), "dagctl-operator".to_string()),
            (LABEL_PROJECT.to_string(), project.metadata.name.clone()),
            (LABEL_RUN.to_string(), run.metadata.name.clone()),
            (LABEL_RUN_TYPE.to_string(), run.spec.run_type.as_str().to_string()),
        ])
    }

    fn clone_step(&self, project: &Project) -> Step {
        let workspace = &self.defaults.workspace_root;
        let git = &project.spec.git;

        // Repository and ref travel as env vars so they are never spliced
        // into the shell line.
        let script = format!(
            "git clone \"$GIT_REPOSITORY\" {ws} && cd {ws} && git checkout \"$GIT_REF\"",
            ws = workspace
        );

        let mut volume_mounts = vec![VolumeMount::new(WORKSPACE_VOLUME, workspace.clone())];
        if !git.ssh_key_secret.is_empty() {
            volume_mounts
                .push(VolumeMount::new(SSH_VOLUME, self.defaults.ssh_mount_path.clone()).read_only());
        }

        let env_from = if git.auth_secret.is_empty() {
            Vec::new()
        } else {
            vec![EnvFromSource {
                secret_name: git.auth_secret.clone(),
            }]
        };

        Step {
            name: CLONE_STEP.to_string(),
            image: self.defaults.git_image.clone(),
            command: vec!["sh".to_string(), "-c".to_string(), script],
            working_dir: String::new(),
            env: vec![
                EnvVar::value("GIT_REPOSITORY", git.repository.clone()),
                EnvVar::value("GIT_REF", self.resolve_git_ref(project)),
            ],
            env_from,
            resources: Default::default(),
            volume_mounts,
        }
    }

    fn main_step(&self, project: &Project, command: Vec<String>) -> Step {
        let mut volume_mounts = vec![VolumeMount::new(
            WORKSPACE_VOLUME,
            self.defaults.workspace_root.clone(),
        )];
        if has_profiles(project) {
            volume_mounts.push(VolumeMount::new(
                PROFILES_VOLUME,
                self.defaults.profiles_mount_path.clone(),
            ));
        }
        volume_mounts.extend(project.spec.volume_mounts.iter().cloned());

        Step {
            name: MAIN_STEP.to_string(),
            image: self.resolve_image(project),
            command,
            working_dir: self.working_dir(project),
            env: project.spec.env.clone(),
            env_from: Vec::new(),
            resources: project.spec.resources.clone(),
            volume_mounts,
        }
    }

    fn volumes(&self, project: &Project) -> Vec<Volume> {
        let spec = &project.spec;
        let mut volumes = vec![Volume {
            name: WORKSPACE_VOLUME.to_string(),
            source: VolumeSource::EmptyDir,
        }];

        if !spec.profiles_config_map.is_empty() {
            volumes.push(Volume {
                name: PROFILES_VOLUME.to_string(),
                source: VolumeSource::ConfigMap {
                    name: spec.profiles_config_map.clone(),
                },
            });
        } else if !spec.profiles_secret.is_empty() {
            volumes.push(Volume {
                name: PROFILES_VOLUME.to_string(),
                source: VolumeSource::Secret {
                    secret_name: spec.profiles_secret.clone(),
                    default_mode: None,
                },
            });
        }

        if !spec.git.ssh_key_secret.is_empty() {
            volumes.push(Volume {
                name: SSH_VOLUME.to_string(),
                source: VolumeSource::Secret {
                    secret_name: spec.git.ssh_key_secret.clone(),
                    default_mode: Some(self.defaults.ssh_key_mode),
                },
            });
        }

        volumes.extend(spec.volume_claim_templates.iter().map(|template| Volume {
            name: template.name.clone(),
            source: VolumeSource::Ephemeral {
                claim: template.clone(),
            },
        }));

        volumes
    }

    /// Builds the complete unit for `run`, stamped with `now`
    pub fn build(&self, run: &Run, project: &Project, now: DateTime<Utc>) -> ExecutionUnit {
        let commands = self.resolve_commands(run, project);
        let mut command = vec![self.defaults.tool.clone()];
        command.extend(commands);

        let annotations = BTreeMap::from([
            (ANNOTATION_COMMAND.to_string(), command.join(" ")),
            (
                ANNOTATION_CREATED_AT.to_string(),
                now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            ),
        ]);

        let key = self.unit_key(run);
        let mut metadata = ObjectMeta::named(key.namespace, key.name);
        metadata.labels = self.labels(run, project);
        metadata.annotations = annotations;
        metadata.owner_references = vec![run.controller_ref()];

        ExecutionUnit {
            metadata,
            spec: UnitSpec {
                init_steps: vec![self.clone_step(project)],
                steps: vec![self.main_step(project, command)],
                volumes: self.volumes(project),
                restart_policy: RestartPolicy::Never,
                service_account_name: project.spec.service_account_name.clone(),
                ttl_seconds_after_finished: run.spec.ttl_seconds_after_finished,
            },
            status: UnitStatus::default(),
        }
    }

    /// Creates the unit for `run`, or adopts one this run already created
    ///
    /// The fixed name turns a duplicate launch into an `AlreadyExists`
    /// conflict, which is resolved by checking the controller edge.
    pub async fn launch(
        &self,
        store: &dyn Store,
        run: &Run,
        project: &Project,
    ) -> Result<ExecutionUnit, BuildError> {
        if run.metadata.uid.is_empty() {
            return Err(BuildError::Unpersisted(run.key()));
        }

        let unit = self.build(run, project, Utc::now());
        let key = unit.key();

        match store.units().create(unit).await {
            Ok(created) => {
                info!("Created execution unit {} for run {}", key, run.key());
                Ok(created)
            }
            Err(err) if err.is_already_exists() => {
                let existing = store.units().get(&key).await?.ok_or(err)?;
                if existing.metadata.is_controlled_by(&run.metadata.uid) {
                    info!("Adopted existing execution unit {} for run {}", key, run.key());
                    Ok(existing)
                } else {
                    Err(BuildError::NameTaken {
                        unit: key,
                        run: run.key(),
                    })
                }
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn has_profiles(project: &Project) -> bool {
    !project.spec.profiles_config_map.is_empty() || !project.spec.profiles_secret.is_empty()
}
