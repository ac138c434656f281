//! Post-compile verification and sandboxing pass.
//!
//! The compiler worker emits its module IR as the compiled artifact. The
//! verifier walks every type and method in that IR and only ever inserts
//! failure paths: bodiless (native) methods and methods touching denied
//! namespaces are rewritten to raise a security error at their first call,
//! never silently removed. Behavior of compliant code is untouched, and the
//! pass is deterministic.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::SecurityConfig;
use crate::error::{ForgeError, ForgeResult};

/// Module intermediate representation produced by the compiler worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleIr {
    /// Output name of the module
    pub name: String,
    /// Top-level types
    pub types: Vec<TypeIr>,
}

/// One top-level type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeIr {
    /// Type name
    pub name: String,
    /// Whether the loader can construct it without arguments
    pub has_default_ctor: bool,
    /// Methods declared on the type
    pub methods: Vec<MethodIr>,
}

/// One method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodIr {
    /// Method name
    pub name: String,
    /// Instruction body; `None` marks an external/native method
    pub body: Option<Vec<InstrIr>>,
}

/// IR instructions, reduced to what the verifier cares about: symbol
/// references and opaque opcodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InstrIr {
    /// Call into a namespaced symbol
    Call {
        /// Fully qualified symbol, e.g. `sys.io.file.read`
        symbol: String,
    },
    /// Field or property access on a namespaced symbol
    Access {
        /// Fully qualified symbol
        symbol: String,
    },
    /// Raise a security error naming the blocked symbol (inserted by the
    /// verifier, executed only if the offending path runs)
    RaiseSecurity {
        /// The blocked symbol
        symbol: String,
    },
    /// Any other opcode, carried through untouched
    Other {
        /// Opcode mnemonic
        code: String,
    },
}

impl InstrIr {
    fn symbol(&self) -> Option<&str> {
        match self {
            Self::Call { symbol } | Self::Access { symbol } => Some(symbol),
            _ => None,
        }
    }
}

/// A constructor published by a verified binary, looked up by plugin name
/// instead of scanning types at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorySpec {
    /// Plugin name the constructor belongs to
    pub plugin: String,
    /// Entry type backing the constructor
    pub type_name: String,
}

/// Output of one verification pass.
#[derive(Debug)]
pub struct VerifiedBinary {
    /// The (possibly patched) module
    pub module: ModuleIr,
    /// Serialized bytes of the patched module (the original bytes when
    /// nothing was touched)
    pub patched: Vec<u8>,
    /// SHA-256 digest of the patched bytes
    pub digest: String,
    /// Structural errors mapped back to their owning plugin units
    pub structural_errors: Vec<ForgeError>,
    /// Non-fatal findings (namespace pollution)
    pub warnings: Vec<String>,
    /// Published constructor table
    pub factories: Vec<FactorySpec>,
    /// Number of method bodies replaced with security raisers
    pub patched_methods: usize,
}

/// Walks compiled modules and patches out disallowed API usage.
#[derive(Debug, Clone)]
pub struct Verifier {
    denied: Vec<String>,
    allowed: Vec<String>,
}

impl Verifier {
    /// Build a verifier from the configured deny/allow lists.
    pub fn new(config: &SecurityConfig) -> Self {
        Self {
            denied: config.denied_namespaces.iter().map(|s| s.to_ascii_lowercase()).collect(),
            allowed: config.allowed_members.iter().map(|s| s.to_ascii_lowercase()).collect(),
        }
    }

    /// Whether a fully qualified symbol falls under a denied namespace and
    /// under no sanctioned member.
    pub fn is_denied(&self, symbol: &str) -> bool {
        let symbol = symbol.to_ascii_lowercase();
        if self.allowed.iter().any(|prefix| namespace_match(&symbol, prefix)) {
            return false;
        }
        self.denied.iter().any(|prefix| namespace_match(&symbol, prefix))
    }

    /// Verify raw compiled bytes against the plugin units being compiled.
    ///
    /// `members` are the plugin names the batch compiled; each must appear
    /// as an entry type with a usable default constructor.
    pub fn verify(&self, raw: &[u8], members: &[String]) -> ForgeResult<VerifiedBinary> {
        let mut module: ModuleIr = serde_json::from_slice(raw).map_err(|e| {
            ForgeError::Infrastructure(format!("compiler produced an unreadable artifact: {e}"))
        })?;

        let mut structural_errors = Vec::new();
        let mut warnings = Vec::new();
        let mut factories = Vec::new();
        let mut patched_methods = 0usize;
        let mut touched = false;

        for type_ir in &mut module.types {
            match members.iter().find(|m| m.eq_ignore_ascii_case(&type_ir.name)) {
                Some(member) => {
                    if type_ir.has_default_ctor {
                        factories.push(FactorySpec {
                            plugin: member.clone(),
                            type_name: type_ir.name.clone(),
                        });
                    } else {
                        structural_errors.push(ForgeError::Structural {
                            unit: member.clone(),
                            reason: format!(
                                "entry type '{}' has no usable default constructor",
                                type_ir.name
                            ),
                        });
                    }
                }
                None => {
                    warnings.push(format!(
                        "namespace pollution: unexpected top-level type '{}'",
                        type_ir.name
                    ));
                }
            }

            for method in &mut type_ir.methods {
                match &method.body {
                    None => {
                        // Native calls are never permitted.
                        let symbol = format!("native:{}.{}", type_ir.name, method.name);
                        method.body = Some(vec![InstrIr::RaiseSecurity { symbol }]);
                        patched_methods += 1;
                        touched = true;
                    }
                    Some(body) => {
                        if let Some(symbol) = body
                            .iter()
                            .filter_map(InstrIr::symbol)
                            .find(|s| self.is_denied(s))
                            .map(str::to_string)
                        {
                            debug!(
                                method = %format!("{}.{}", type_ir.name, method.name),
                                symbol = %symbol,
                                "patching method body with security raiser"
                            );
                            method.body = Some(vec![InstrIr::RaiseSecurity { symbol }]);
                            patched_methods += 1;
                            touched = true;
                        }
                    }
                }
            }
        }

        for member in members {
            let present = module.types.iter().any(|t| t.name.eq_ignore_ascii_case(member));
            if !present {
                structural_errors.push(ForgeError::Structural {
                    unit: member.clone(),
                    reason: format!("compiled output contains no type named '{member}'"),
                });
            }
        }

        for warning in &warnings {
            warn!("{warning}");
        }

        let patched = if touched {
            serde_json::to_vec(&module).map_err(|e| {
                ForgeError::Infrastructure(format!("failed to serialize patched module: {e}"))
            })?
        } else {
            raw.to_vec()
        };

        let digest = format!("{:x}", Sha256::digest(&patched));

        Ok(VerifiedBinary {
            module,
            patched,
            digest,
            structural_errors,
            warnings,
            factories,
            patched_methods,
        })
    }
}

/// Prefix match on namespace boundaries: `sys.io` covers `sys.io.file.read`
/// but not `sys.iodine`.
fn namespace_match(symbol: &str, prefix: &str) -> bool {
    symbol == prefix
        || (symbol.len() > prefix.len()
            && symbol.starts_with(prefix)
            && symbol.as_bytes()[prefix.len()] == b'.')
}
