//! Default values for configuration fields.
//!
//! These functions are used by serde for default deserialization.

// ============================================================================
// Common Defaults
// ============================================================================

pub fn r#true() -> bool {
    true
}

pub fn r#false() -> bool {
    false
}

// ============================================================================
// [source] Section Defaults
// ============================================================================

pub mod source {
    use std::path::PathBuf;

    pub fn root() -> PathBuf {
        "src".into()
    }

    pub fn data() -> PathBuf {
        "data/site.json".into()
    }

    pub fn views() -> PathBuf {
        "views".into()
    }

    pub fn template_ext() -> String {
        "njk".into()
    }

    pub fn stylesheets() -> PathBuf {
        "assets/css".into()
    }

    pub fn scripts() -> PathBuf {
        "assets/js".into()
    }

    pub fn images() -> PathBuf {
        "assets/images".into()
    }

    pub fn statics() -> PathBuf {
        "static".into()
    }
}

// ============================================================================
// [build] Section Defaults
// ============================================================================

pub mod build {
    use std::path::PathBuf;

    pub fn output() -> PathBuf {
        "dist".into()
    }

    pub fn stylesheets() -> PathBuf {
        "assets/css".into()
    }

    pub fn scripts() -> PathBuf {
        "assets/js".into()
    }

    pub fn images() -> PathBuf {
        "assets/images".into()
    }
}

// ============================================================================
// [serve] Section Defaults
// ============================================================================

pub mod serve {
    pub fn interface() -> String {
        "127.0.0.1".into()
    }

    pub fn port() -> u16 {
        5277
    }

    pub fn reload_port() -> u16 {
        35729
    }
}
