use crate::cloud::CloudError;
use crate::startup_script::StartupScriptError;
use snafu::Snafu;

/// Errors `Controller::find_resource`/`sync_resource` can surface.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ControllerError {
    #[snafu(display("cloud API call failed: {}", source))]
    Cloud { source: CloudError },

    #[snafu(display("disk '{}' still has attached users, refusing to reuse it", disk))]
    DiskInUse { disk: String },

    #[snafu(display("failed to render startup script: {}", source))]
    StartupScript { source: StartupScriptError },
}

impl From<CloudError> for ControllerError {
    fn from(source: CloudError) -> Self {
        ControllerError::Cloud { source }
    }
}
