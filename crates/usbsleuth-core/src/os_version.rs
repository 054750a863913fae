/// Windows version detection and install-log grammar selection.
///
/// Several releases share a kernel version string (Windows 7 and Server
/// 2008 R2 are both "6.1"), so the table maps many releases to one version
/// and the grammar is chosen per release family.
use serde::Serialize;

/// Which `setupapi` log layout to expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogGrammar {
    /// `setupapi.log` of Windows 2000 / XP / Server 2003.
    Legacy,
    /// `setupapi.dev.log` of Vista / Server 2008.
    Vista,
    /// `setupapi.dev.log` of Windows 7 and later.
    Modern,
}

pub struct WindowsRelease {
    pub name: &'static str,
    pub version: &'static str,
    pub grammar: LogGrammar,
}

pub const WINDOWS_RELEASES: &[WindowsRelease] = &[
    WindowsRelease {
        name: "Windows 2000",
        version: "5.0",
        grammar: LogGrammar::Legacy,
    },
    WindowsRelease {
        name: "Windows XP",
        version: "5.1",
        grammar: LogGrammar::Legacy,
    },
    WindowsRelease {
        name: "Windows XP x64",
        version: "5.2",
        grammar: LogGrammar::Legacy,
    },
    WindowsRelease {
        name: "Windows Server 2003",
        version: "5.2",
        grammar: LogGrammar::Legacy,
    },
    WindowsRelease {
        name: "Windows Server 2003 R2",
        version: "5.2",
        grammar: LogGrammar::Legacy,
    },
    WindowsRelease {
        name: "Windows Vista",
        version: "6.0",
        grammar: LogGrammar::Vista,
    },
    WindowsRelease {
        name: "Windows Server 2008",
        version: "6.0",
        grammar: LogGrammar::Vista,
    },
    WindowsRelease {
        name: "Windows 7",
        version: "6.1",
        grammar: LogGrammar::Modern,
    },
    WindowsRelease {
        name: "Windows Server 2008 R2",
        version: "6.1",
        grammar: LogGrammar::Modern,
    },
    WindowsRelease {
        name: "Windows 8",
        version: "6.2",
        grammar: LogGrammar::Modern,
    },
    WindowsRelease {
        name: "Windows Server 2012",
        version: "6.2",
        grammar: LogGrammar::Modern,
    },
    WindowsRelease {
        name: "Windows 8.1",
        version: "6.3",
        grammar: LogGrammar::Modern,
    },
    WindowsRelease {
        name: "Windows Server 2012 R2",
        version: "6.3",
        grammar: LogGrammar::Modern,
    },
    WindowsRelease {
        name: "Windows 10",
        version: "6.4",
        grammar: LogGrammar::Modern,
    },
];

pub const UNDEFINED_VERSION: &str = "undefined";

/// Grammar for a `CurrentVersion` string. Unknown versions use the
/// modern layout.
pub fn grammar_for(version: &str) -> LogGrammar {
    let version = version.trim();
    WINDOWS_RELEASES
        .iter()
        .find(|r| r.version == version)
        .map(|r| r.grammar)
        .unwrap_or(LogGrammar::Modern)
}

/// All release names sharing `version`.
pub fn releases_for(version: &str) -> Vec<&'static str> {
    let version = version.trim();
    WINDOWS_RELEASES
        .iter()
        .filter(|r| r.version == version)
        .map(|r| r.name)
        .collect()
}

/// The detected (or forced) `CurrentVersion` for the run.
#[derive(Debug, Clone, Default)]
pub struct OsVersionContext {
    detected: Option<String>,
    forced: Option<String>,
}

impl OsVersionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context whose version ignores anything the SOFTWARE hive says.
    pub fn with_override(version: Option<String>) -> Self {
        Self {
            detected: None,
            forced: version.filter(|v| !v.trim().is_empty()),
        }
    }

    /// Record the version read from a SOFTWARE hive. The last hive read
    /// wins.
    pub fn set_detected(&mut self, version: &str) {
        self.detected = Some(version.trim().to_string());
    }

    pub fn is_forced(&self) -> bool {
        self.forced.is_some()
    }

    pub fn version(&self) -> &str {
        self.forced
            .as_deref()
            .or(self.detected.as_deref())
            .unwrap_or(UNDEFINED_VERSION)
    }

    pub fn grammar(&self) -> LogGrammar {
        grammar_for(self.version())
    }

    /// Release names for the effective version, empty when unknown.
    pub fn release_names(&self) -> Vec<&'static str> {
        releases_for(self.version())
    }
}
