//! Stage vocabulary and build ordering.
//!
//! Stages are grouped into phases. Phases run one after another; stages of
//! the same phase share no state and may run concurrently.
//!
//! | Phase | Stages                                    |
//! |-------|-------------------------------------------|
//! | 0     | `Data`                                    |
//! | 1     | `Views`                                   |
//! | 2     | `Html` (reads site data and partials)     |
//! | 3     | `Styles`, `Scripts`, `Images`, `Static`   |

use std::fmt;

/// One category of asset transformation.
///
/// The declaration order is the build order used by [`crate::plan::BuildPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Data,
    Views,
    Html,
    Styles,
    Scripts,
    Images,
    Static,
}

impl Stage {
    pub const ALL: [Self; 7] = [
        Self::Data,
        Self::Views,
        Self::Html,
        Self::Styles,
        Self::Scripts,
        Self::Images,
        Self::Static,
    ];

    /// Short name, used for logs and cache scopes.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Views => "views",
            Self::Html => "html",
            Self::Styles => "css",
            Self::Scripts => "js",
            Self::Images => "images",
            Self::Static => "static",
        }
    }

    /// Cache scope holding this stage's entries.
    pub const fn scope(self) -> &'static str {
        self.name()
    }

    pub const fn phase(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Views => 1,
            Self::Html => 2,
            Self::Styles | Self::Scripts | Self::Images | Self::Static => 3,
        }
    }

    /// Stages whose results this stage reads.
    pub const fn upstream(self) -> &'static [Self] {
        match self {
            Self::Html => &[Self::Data, Self::Views],
            _ => &[],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
