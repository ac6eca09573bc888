//! # Stevedore Docker backend
//!
//! Implements the core [`Backend`] trait directly against the Docker API.
//!
//! Restart semantics are delegated to Docker's restart policy; an instance
//! started here stays up until [`Backend::terminate`] removes it. Name
//! collisions are resolved in favor of the new container: an existing
//! container with the same name is killed and removed before creation.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use stevedore_core::{Backend, Error, InstanceHandle, InstanceStatus, Result, RunConfig};

/// Container backend talking to a local (or `DOCKER_HOST`-addressed)
/// Docker daemon.
pub struct DockerBackend {
    client: Docker,
}

fn docker_err(err: bollard::errors::Error) -> Error {
    Error::Backend(err.to_string())
}

impl DockerBackend {
    /// Connects to the daemon. `docker_host` overrides the default socket,
    /// accepting `unix://` paths and `tcp://`/`http://` addresses.
    pub fn connect(docker_host: Option<&str>) -> Result<Self> {
        let client = match docker_host {
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_unix(host, 120, bollard::API_DEFAULT_VERSION)
            }
            Some(host) => Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(docker_err)?;
        Ok(DockerBackend { client })
    }

    /// Pulls the image when it is not known locally.
    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.client.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        info!(%image, "pulling image");
        let mut pull = self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            progress.map_err(docker_err)?;
        }
        Ok(())
    }

    /// Removes a same-named leftover container, so creation cannot fail on
    /// a name collision.
    async fn remove_existing(&self, name: &str) -> Result<()> {
        if self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .is_err()
        {
            return Ok(());
        }
        info!(%name, "removing existing container");
        self.client
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(docker_err)
    }

    fn container_config(runcfg: &RunConfig, open_stdin: bool) -> Config<String> {
        let env: Vec<String> = runcfg
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        // Ports need to be pre-declared on the container or the bindings
        // will not take effect on start.
        let exposed_ports: HashMap<String, HashMap<(), ()>> = runcfg
            .ports
            .keys()
            .map(|port| (format!("{port}/tcp"), HashMap::new()))
            .collect();
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = runcfg
            .ports
            .iter()
            .map(|(port, bindings)| {
                let bindings = bindings
                    .iter()
                    .map(|binding| PortBinding {
                        host_ip: Some(binding.ip.clone()),
                        host_port: binding.port.map(|p| p.to_string()),
                    })
                    .collect();
                (format!("{port}/tcp"), Some(bindings))
            })
            .collect();
        let binds: Vec<String> = runcfg
            .volumes
            .iter()
            .map(|(host, container)| format!("{host}:{container}"))
            .collect();
        let links: Vec<String> = runcfg
            .links
            .iter()
            .map(|(name, alias)| format!("{name}:{alias}"))
            .collect();

        Config {
            image: Some(runcfg.image.clone()),
            cmd: Some(runcfg.cmd.clone()),
            entrypoint: Some(runcfg.entrypoint.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            attach_stdin: Some(open_stdin),
            open_stdin: Some(open_stdin),
            stdin_once: Some(open_stdin),
            host_config: Some(HostConfig {
                binds: Some(binds),
                port_bindings: Some(port_bindings),
                privileged: Some(runcfg.privileged),
                links: Some(links),
                restart_policy: if open_stdin {
                    None
                } else {
                    Some(RestartPolicy {
                        name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                        maximum_retry_count: None,
                    })
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn create(&self, runcfg: &RunConfig, open_stdin: bool) -> Result<String> {
        if !runcfg.name.is_empty() {
            self.remove_existing(&runcfg.name).await?;
        }
        self.ensure_image(&runcfg.image).await?;

        debug!(name = %runcfg.name, image = %runcfg.image, "creating container");
        let options = (!runcfg.name.is_empty()).then(|| CreateContainerOptions {
            name: runcfg.name.clone(),
            platform: None,
        });
        let created = self
            .client
            .create_container(options, Self::container_config(runcfg, open_stdin))
            .await
            .map_err(docker_err)?;
        Ok(created.id)
    }

    /// Creates the host-side volume directories a runcfg mounts.
    async fn ensure_volumes(&self, runcfg: &RunConfig) -> Result<()> {
        for host_path in runcfg.volumes.keys() {
            tokio::fs::create_dir_all(host_path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for DockerBackend {
    async fn prepare(&self, runcfg: &RunConfig, _service: &str) -> Result<InstanceHandle> {
        let id = self.create(runcfg, false).await?;
        self.ensure_volumes(runcfg).await?;
        Ok(InstanceHandle {
            id,
            name: runcfg.name.clone(),
        })
    }

    async fn start(
        &self,
        _runcfg: &RunConfig,
        _service: &str,
        handle: InstanceHandle,
    ) -> Result<InstanceHandle> {
        self.client
            .start_container(&handle.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(docker_err)?;
        Ok(handle)
    }

    async fn terminate(&self, handle: &InstanceHandle) -> Result<()> {
        // An already-gone instance is a no-op, not an error.
        if let Err(err) = self
            .client
            .stop_container(&handle.id, Some(StopContainerOptions { t: 10 }))
            .await
        {
            debug!(id = %handle.id, error = %err, "stop failed, instance likely gone");
        }
        if let Err(err) = self
            .client
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            debug!(id = %handle.id, error = %err, "remove failed, instance likely gone");
        }
        Ok(())
    }

    async fn once(&self, runcfg: &RunConfig) -> Result<i64> {
        let feed_stdin = runcfg.stdin.is_some();
        let id = self.create(runcfg, feed_stdin).await?;
        self.ensure_volumes(runcfg).await?;

        let mut attached = None;
        if feed_stdin {
            attached = Some(
                self.client
                    .attach_container(
                        &id,
                        Some(AttachContainerOptions::<String> {
                            stdin: Some(true),
                            stream: Some(true),
                            ..Default::default()
                        }),
                    )
                    .await
                    .map_err(docker_err)?,
            );
        }

        self.client
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
            .map_err(docker_err)?;

        if let (Some(mut attached), Some(path)) = (attached, &runcfg.stdin) {
            let bytes = tokio::fs::read(path).await?;
            attached.input.write_all(&bytes).await?;
            attached.input.shutdown().await?;
        }

        let mut wait = self
            .client
            .wait_container(&id, None::<WaitContainerOptions<String>>);
        let exit = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(err)) => return Err(docker_err(err)),
            None => {
                return Err(Error::Backend("wait stream ended without a status".into()));
            }
        };

        if let Err(err) = self
            .client
            .remove_container(
                &id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            warn!(%id, error = %err, "could not remove one-shot container");
        }
        Ok(exit)
    }

    async fn status(&self, handle: &InstanceHandle) -> Result<InstanceStatus> {
        let inspected = self
            .client
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
            .map_err(docker_err)?;
        let running = inspected
            .state
            .and_then(|state| state.running)
            .unwrap_or(false);
        Ok(if running {
            InstanceStatus::Running
        } else {
            InstanceStatus::Stopped
        })
    }
}
