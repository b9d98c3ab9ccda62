//! SPIR-V shader loading
//!
//! Pipelines ask a [`ShaderLoader`] for bytecode by logical name
//! (`"simple_shader.vert"`). The loader decides where the words come from:
//! [`SpirvDirectoryLoader`] searches a list of directories for `<name>.spv`,
//! [`MemoryShaderLoader`] serves bytecode registered at runtime.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// First word of every SPIR-V module
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Shader lookup failures
#[derive(Error, Debug)]
pub enum ShaderError {
    /// No bytecode under that name
    #[error("shader '{name}' not found (searched: {searched:?})")]
    NotFound {
        /// Requested shader name
        name: String,
        /// Locations that were tried
        searched: Vec<PathBuf>,
    },

    /// Bytecode exists but is not SPIR-V
    #[error("shader '{name}' is malformed: {reason}")]
    Malformed {
        /// Requested shader name
        name: String,
        /// What was wrong
        reason: String,
    },

    /// Reading the file failed
    #[error("IO error reading shader: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of compiled shader bytecode
pub trait ShaderLoader: Send + Sync {
    /// SPIR-V words for a logical shader name
    fn load(&self, name: &str) -> Result<Vec<u32>, ShaderError>;
}

/// Decode SPIR-V bytes into words and check the magic number
pub fn parse_spirv(name: &str, bytes: &[u8]) -> Result<Vec<u32>, ShaderError> {
    if bytes.len() % 4 != 0 {
        return Err(ShaderError::Malformed {
            name: name.to_string(),
            reason: format!("length {} is not a multiple of 4", bytes.len()),
        });
    }
    let words = ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|e| ShaderError::Malformed {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(other) => Err(ShaderError::Malformed {
            name: name.to_string(),
            reason: format!("bad magic number {other:#010x}"),
        }),
        None => Err(ShaderError::Malformed {
            name: name.to_string(),
            reason: "empty module".to_string(),
        }),
    }
}

/// Loads `<dir>/<name>.spv` from the first directory that has it
#[derive(Debug, Clone)]
pub struct SpirvDirectoryLoader {
    search_dirs: Vec<PathBuf>,
}

impl SpirvDirectoryLoader {
    /// Loader over the given directories, searched in order
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            search_dirs: dirs.into_iter().map(Into::into).collect(),
        }
    }

    /// Directories searched
    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let file = if Path::new(name).extension().is_some_and(|ext| ext == "spv") {
            name.to_string()
        } else {
            format!("{name}.spv")
        };
        self.search_dirs.iter().map(|dir| dir.join(&file)).collect()
    }
}

impl ShaderLoader for SpirvDirectoryLoader {
    fn load(&self, name: &str) -> Result<Vec<u32>, ShaderError> {
        let searched = self.candidates(name);
        let Some(path) = searched.iter().find(|path| path.is_file()) else {
            return Err(ShaderError::NotFound {
                name: name.to_string(),
                searched,
            });
        };
        log::debug!("Loading shader '{}' from {:?}", name, path);
        let bytes = std::fs::read(path)?;
        parse_spirv(name, &bytes)
    }
}

/// Shader bytecode held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryShaderLoader {
    modules: HashMap<String, Vec<u32>>,
}

impl MemoryShaderLoader {
    /// Empty loader
    pub fn new() -> Self {
        Self::default()
    }

    /// Register words under a name
    pub fn insert(&mut self, name: impl Into<String>, words: Vec<u32>) {
        self.modules.insert(name.into(), words);
    }

    /// Builder form of [`insert`](Self::insert)
    pub fn with(mut self, name: impl Into<String>, words: Vec<u32>) -> Self {
        self.insert(name, words);
        self
    }
}

impl ShaderLoader for MemoryShaderLoader {
    fn load(&self, name: &str) -> Result<Vec<u32>, ShaderError> {
        let words = self.modules.get(name).ok_or_else(|| ShaderError::NotFound {
            name: name.to_string(),
            searched: Vec::new(),
        })?;
        if words.first() != Some(&SPIRV_MAGIC) {
            return Err(ShaderError::Malformed {
                name: name.to_string(),
                reason: "missing SPIR-V magic number".to_string(),
            });
        }
        Ok(words.clone())
    }
}
