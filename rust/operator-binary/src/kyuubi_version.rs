use std::{ops::Deref, str::FromStr};

use snafu::{ResultExt as _, Snafu};

/// Represent a Kyuubi version as a Semver
///
/// Kyuubi releases are plain `major.minor.patch`, but the RELEASE file and the peer
/// databag sometimes carry only `major.minor`, which is padded with a zero patch.
#[derive(Clone, Debug, Eq, PartialEq, PartialOrd)]
pub struct KyuubiVersion(semver::Version);

impl Deref for KyuubiVersion {
    type Target = semver::Version;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("unable to parse Kyuubi version from {input:?}"))]
    ParseVersion {
        source: semver::Error,
        input: String,
    },
}

impl FromStr for KyuubiVersion {
    type Err = Error;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let padded = match trimmed.split('.').count() {
            2 => format!("{trimmed}.0"),
            _ => trimmed.to_string(),
        };
        let version = semver::Version::parse(&padded).context(ParseVersionSnafu { input })?;
        Ok(Self(version))
    }
}

/// Whether a workload running `old` may be replaced in place by one running `new`:
/// same major, and a minor that does not go backwards.
pub fn is_workload_compatible(old: &str, new: &str) -> bool {
    match (old.parse::<KyuubiVersion>(), new.parse::<KyuubiVersion>()) {
        (Ok(old), Ok(new)) => old.major == new.major && new.minor >= old.minor,
        (Err(error), _) | (_, Err(error)) => {
            tracing::warn!(%error, "unable to compare Kyuubi versions");
            false
        }
    }
}
