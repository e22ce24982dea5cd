//! Height-activated soft-fork deployments.

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Deployment {
    /// Height in coinbase, block version 2.
    Bip34 = 0,
    /// Strict DER signatures, block version 3.
    Bip66 = 1,
    /// CHECKLOCKTIMEVERIFY, block version 4.
    Bip65 = 2,
    /// Relative lock times, CHECKSEQUENCEVERIFY and median-time-past finality.
    Csv = 3,
    /// Segregated witness.
    Segwit = 4,
}

pub const MAX_DEPLOYMENTS: usize = 5;

pub const ALL_DEPLOYMENTS: [Deployment; MAX_DEPLOYMENTS] = [
    Deployment::Bip34,
    Deployment::Bip66,
    Deployment::Bip65,
    Deployment::Csv,
    Deployment::Segwit,
];

impl Deployment {
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Deployment::Bip34 => "bip34",
            Deployment::Bip66 => "bip66",
            Deployment::Bip65 => "bip65",
            Deployment::Csv => "csv",
            Deployment::Segwit => "segwit",
        }
    }

    /// Lowest block version accepted once the deployment is active, if it bumps the version.
    pub const fn min_block_version(self) -> Option<i32> {
        match self {
            Deployment::Bip34 => Some(2),
            Deployment::Bip66 => Some(3),
            Deployment::Bip65 => Some(4),
            Deployment::Csv | Deployment::Segwit => None,
        }
    }
}

/// Activation height per deployment, `NO_ACTIVATION_HEIGHT` when disabled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeploymentHeights(pub [i32; MAX_DEPLOYMENTS]);

impl DeploymentHeights {
    pub const NO_ACTIVATION_HEIGHT: i32 = -1;

    pub fn activation_height(&self, deployment: Deployment) -> i32 {
        self.0[deployment.as_usize()]
    }
}

pub fn deployment_active(height: i32, heights: &DeploymentHeights, deployment: Deployment) -> bool {
    let activation = heights.activation_height(deployment);
    activation != DeploymentHeights::NO_ACTIVATION_HEIGHT && height >= activation
}

/// Minimum header version required at `height` given every active deployment.
pub fn min_block_version(height: i32, heights: &DeploymentHeights) -> i32 {
    ALL_DEPLOYMENTS
        .iter()
        .filter(|deployment| deployment_active(height, heights, **deployment))
        .filter_map(|deployment| deployment.min_block_version())
        .max()
        .unwrap_or(1)
}
