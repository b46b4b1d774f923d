//! JobDoc - durable markdown job documents
//!
//! A job document is a YAML frontmatter block followed by a markdown body.
//! This crate owns everything that touches those bytes:
//!
//! - [`frontmatter`] - parse, partial update and canonical rebuild
//! - [`chat`] - chat turn parsing, block directives and extraction
//! - [`atomic`] - atomic file replacement and reads
//! - [`lock`] - PID lock files guarding a running job
//!
//! Nothing here knows about plans or scheduling; callers decide what the
//! metadata means.

pub mod atomic;
pub mod chat;
pub mod error;
pub mod frontmatter;
pub mod lock;

pub use atomic::{read_document, write_atomic};
pub use chat::{
    BlockSelector, ChatDirective, ChatTurn, Extracted, SourceBlock, Speaker, TURN_SEPARATOR, append_llm_turn,
    duplicate_block_ids, extract, extract_blocks, parse_chat_file,
};
pub use error::{DocError, DocResult};
pub use frontmatter::{Changes, Document, parse, rebuild, str_field, update};
pub use lock::{JobLock, LockState, lock_path, lock_state};
