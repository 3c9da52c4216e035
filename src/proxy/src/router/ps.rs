use crate::buffer::Buffer;
use crate::classifier::{Parser, TypeMask};
use crate::protocol::mysql::basic::extract_ps_id;
use crate::protocol::mysql::constants::{CommandCode, PS_DIRECT_EXEC_ID};

use hashbrown::HashMap;
use tracing::warn;

/// How loudly to report operations on prepared statements the manager has
/// no record of. Drivers that close statements twice make `Warn` noisy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PsLogVerbosity {
    None,
    #[default]
    Warn,
}

/// What the router remembers about one prepared statement: how the
/// statement would route, how many parameters it takes, and whether its
/// execution is pinned to the previously used server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreparedStmt {
    pub type_mask: TypeMask,
    pub param_count: u16,
    pub route_to_last_used: bool,
}

/// Registry of the prepared statements of one session: binary-protocol
/// statements under their u32 id, text PREPAREs under their name.
#[derive(Default)]
pub struct PsManager {
    binary_ps: HashMap<u32, PreparedStmt>,
    text_ps: HashMap<String, PreparedStmt>,
    verbosity: PsLogVerbosity,
}

impl PsManager {
    pub fn new(verbosity: PsLogVerbosity) -> Self {
        PsManager {
            verbosity,
            ..Default::default()
        }
    }

    /// The type mask a statement will have when executed, i.e. the mask of
    /// the statement being prepared without the prepare marker itself.
    fn prepare_type(parser: &dyn Parser, buffer: &Buffer) -> TypeMask {
        if buffer.command() == Some(CommandCode::ComStmtPrepare as u8) {
            parser.get_type_mask(buffer) & !TypeMask::PREPARE_STMT
        } else if let Some(stmt) = parser.get_preparable_stmt(buffer) {
            parser.get_type_mask(&stmt)
        } else {
            TypeMask::UNKNOWN
        }
    }

    pub fn store(&mut self, parser: &dyn Parser, buffer: &Buffer, id: u32) {
        debug_assert!(
            buffer.command() == Some(CommandCode::ComStmtPrepare as u8)
                || parser
                    .get_type_mask(buffer)
                    .contains(TypeMask::PREPARE_NAMED_STMT)
        );

        let stmt = PreparedStmt {
            type_mask: Self::prepare_type(parser, buffer),
            param_count: 0,
            route_to_last_used: parser.relates_to_previous(buffer),
        };

        match buffer.command() {
            Some(c) if c == CommandCode::ComQuery as u8 => {
                if let Some(name) = parser.get_prepare_name(buffer) {
                    self.text_ps.insert(name, stmt);
                }
            }
            Some(c) if c == CommandCode::ComStmtPrepare as u8 => {
                self.binary_ps.insert(id, stmt);
            }
            _ => {
                debug_assert!(false, "PsManager::store called with a non-prepare buffer");
            }
        }
    }

    pub fn get(&self, id: u32) -> Option<&PreparedStmt> {
        let found = self.binary_ps.get(&id);
        if found.is_none() && id != PS_DIRECT_EXEC_ID && self.verbosity != PsLogVerbosity::None {
            warn!("Using unknown prepared statement with ID {id}");
        }
        found
    }

    pub fn get_text(&self, id: &str) -> Option<&PreparedStmt> {
        let found = self.text_ps.get(id);
        if found.is_none() && self.verbosity != PsLogVerbosity::None {
            warn!("Using unknown prepared statement with ID '{id}'");
        }
        found
    }

    pub fn erase(&mut self, id: u32) {
        if self.binary_ps.remove(&id).is_none() && self.verbosity != PsLogVerbosity::None {
            warn!("Closing unknown prepared statement with ID {id}");
        }
    }

    pub fn erase_text(&mut self, id: &str) {
        if self.text_ps.remove(id).is_none() && self.verbosity != PsLogVerbosity::None {
            warn!("Closing unknown prepared statement with ID '{id}'");
        }
    }

    /// Remove whatever statement `buffer` refers to.
    pub fn erase_buffer(&mut self, parser: &dyn Parser, buffer: &Buffer) {
        match buffer.command() {
            Some(c) if c == CommandCode::ComQuery as u8 => {
                if let Some(name) = parser.get_prepare_name(buffer) {
                    self.erase_text(&name);
                }
            }
            Some(c) if CommandCode::is_ps_command(c) => {
                self.erase(extract_ps_id(buffer.wire()));
            }
            _ => {
                debug_assert!(false, "PsManager::erase_buffer called with invalid query");
            }
        }
    }

    pub fn set_param_count(&mut self, id: u32, param_count: u16) {
        self.binary_ps.entry(id).or_default().param_count = param_count;
    }

    pub fn param_count(&self, id: u32) -> u16 {
        self.binary_ps
            .get(&id)
            .map(|ps| ps.param_count)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.binary_ps.len() + self.text_ps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.binary_ps.is_empty() && self.text_ps.is_empty()
    }
}
