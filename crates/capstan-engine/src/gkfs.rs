//! The distributed-filesystem co-launch for worker pools.
//!
//! When a runtime's `mode` set contains `gkfs`, the submission script first
//! starts a GekkoFS daemon on every allocated node and waits until each one
//! has registered in the shared hosts file; worker processes are then
//! launched with the interception library preloaded so their file operations
//! go through the distributed filesystem. The script text below is a
//! deployment artifact: it is emitted as-is and carries experimental knobs,
//! so treat it as data rather than logic.

use std::path::Path;
use std::path::PathBuf;

use tokio::fs;
use tracing::debug;

use crate::Error;
use crate::Result;
use crate::scheduler::PoolRequest;

/// The daemon start script launched once per node before the workers.
const DAEMON_START_SCRIPT: &str = r#"#!/bin/bash

module load gcc/12.3.0

export OMPI_MCA_osc=sm
export OMPI_MCA_pml=ob1
export LC_ALL=en_US.UTF-8
export LANG=en_US.UTF-8
export FI_UNIVERSE_SIZE=500

# GekkoFS deployment layout
export GKFS_BASE=/gpfs/${HOME}/gekkofs_base
export GKFS_MNT=/gpfs/${HOME}/mnt
export GEKKODEPS=${GKFS_BASE}/iodeps
export LD_LIBRARY_PATH=$LD_LIBRARY_PATH:${GEKKODEPS}/lib64:${GEKKODEPS}/lib
export PATH=$PATH:${GEKKODEPS}/iodeps/bin
export GKFS_DAEMON=${GEKKODEPS}/bin/gkfs_daemon
export GKFS=${GEKKODEPS}/lib64/libgkfs_intercept.so

# Shared file listing the nodes whose daemon is up
export GKFS_HOSTS_FILE=${HOME}/test/gkfs_hosts.txt
export LIBGKFS_HOSTS_FILE=${HOME}/test/gkfs_hosts.txt
export GKFS_LOG_LEVEL=0
export GKFS_DAEMON_LOG_PATH=${HOME}/test/servers_capstan.txt

# Node-local storage for the daemon's data
export TMP_PATH=$TMPDIR
export GKFS_ROOT="${TMP_PATH}/agkfs_root"
export COMM="-P ofi+verbs"

execute_command() {
    echo "Executing command: '$*'"
    "$@" &
    local pid=$!
    wait "$pid"
    status=$?
    if [ $status -eq 0 ]; then
        echo "Command '$*' completed successfully."
        return 0
    else
        echo "Command '$*' failed with exit code $status."
        return 1
    fi
}

echo "Executing GKFS_DAEMON"
CMD1="${GKFS_DAEMON} --mountdir=${GKFS_MNT:?} --rootdir=${GKFS_ROOT:?} $COMM -l ib0 "
execute_command $CMD1
"#;

/// Where the start script is written, relative to the home directory.
const START_SCRIPT_PATH: &str = ".capstan/gkfs_start.sh";

/// Writes the daemon start script to the shared home directory so every
/// node of the allocation can read it.
pub(crate) async fn write_start_script() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        Error::Config("cannot determine the home directory for the gkfs start script".to_string())
    })?;

    let path = home.join(START_SCRIPT_PATH);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(Error::Io)?;
    }

    debug!("writing the gkfs start script to `{path}`", path = path.display());
    fs::write(&path, DAEMON_START_SCRIPT).await.map_err(Error::Io)?;
    Ok(path)
}

/// Adds the co-launch to a pool submission: daemon exports, the side-car
/// `srun` that starts one daemon per node, the wait for every daemon to
/// register, and the preload flag on the worker launcher.
pub(crate) fn apply(request: &mut PoolRequest, start_script: &Path) {
    request.setup.extend([
        r#"export GKFS_BASE="/gpfs/${HOME}/gekkofs_base""#.to_string(),
        r#"export GEKKODEPS="${GKFS_BASE}/iodeps""#.to_string(),
        "export GKFS_LOG_LEVEL=0".to_string(),
        "export LIBGKFS_LOG=none".to_string(),
        r#"export GKFS="${GEKKODEPS}/lib64/libgkfs_intercept.so""#.to_string(),
        r#"export LIBGKFS_HOSTS_FILE="${HOME}/test/gkfs_hosts.txt""#.to_string(),
        r#"echo "Removing ${LIBGKFS_HOSTS_FILE}""#.to_string(),
        r#"rm "${LIBGKFS_HOSTS_FILE}""#.to_string(),
        format!(
            "srun -c ${{SLURM_CPUS_ON_NODE}} -n ${{SLURM_NNODES}} -N ${{SLURM_NNODES}} \
             --mem=0 --overlap -overcommit --oversubscribe --export='ALL' /bin/bash {script} &",
            script = start_script.display()
        ),
        r#"while [[ ! -f "${LIBGKFS_HOSTS_FILE}" ]]; do sleep 1; done"#.to_string(),
        r#"while [[ $(wc -l < "$LIBGKFS_HOSTS_FILE") -lt ${SLURM_NNODES} ]]; do sleep 1; done"#
            .to_string(),
    ]);

    request.launcher.extend(
        [
            "--mem=0",
            "--oversubscribe",
            "--overlap",
            "--overcommit",
            r#"--export="ALL",LD_PRELOAD=${GKFS}"#,
        ]
        .map(str::to_string),
    );
}
