pub mod plan;
pub mod reconcile;
pub mod status;
pub mod targets;
pub mod teardown;

use anyhow::Result;
use declarative::{CancelToken, ExecuteOptions};
use std::time::Duration;

use crate::Context;
use crate::cli::ClusterArgs;
use crate::config::{self, Config};
use crate::interrupt;
use crate::kubectl::KubectlCluster;

/// Process exit status of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Everything succeeded
    Success,
    /// The run finished but something failed or was skipped
    Failed,
}

impl Exit {
    pub fn code(self) -> i32 {
        match self {
            Exit::Success => 0,
            Exit::Failed => 1,
        }
    }

    pub fn from_success(success: bool) -> Self {
        if success { Exit::Success } else { Exit::Failed }
    }
}

/// Exit code for errors that stop a command before it produces a report
pub const EXIT_ERROR: i32 = 2;

/// Load the config named on the command line, or the default one
pub fn load_config(ctx: &Context) -> Result<Config> {
    let (config, path) = Config::load(ctx.config.as_deref())?;
    log::debug!("Using config {}", path.display());
    Ok(config)
}

/// Executor options and a kubectl client, with command-line overrides applied
pub fn cluster_from(config: &Config, args: &ClusterArgs) -> (ExecuteOptions, KubectlCluster) {
    let mut options = config.execute_options();
    if let Some(secs) = args.timeout {
        options.timeout = Duration::from_secs(secs.max(1));
    }
    let cluster =
        KubectlCluster::new(&config.kubectl, &options.manager).with_context(args.context.clone());
    (options, cluster)
}

/// Scope from the command line, or the configured one
///
/// The scope names a lock file and a label value, so it is checked here.
pub fn scope_from(config: &Config, flag: Option<String>) -> Result<String> {
    let scope = flag.unwrap_or_else(|| config.reconcile.scope.clone());
    config::check_scope(&scope)?;
    Ok(scope)
}

/// Cancellation for a whole run: Ctrl-C, and `max_duration` seconds if given
pub fn cancel_token(max_duration: Option<u64>) -> CancelToken {
    let cancel = CancelToken::new();
    match max_duration {
        Some(0) => cancel.cancel(),
        Some(secs) => cancel.cancel_after(Duration::from_secs(secs)),
        None => {}
    }
    interrupt::watch(&cancel);
    cancel
}
