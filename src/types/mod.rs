mod api;

pub use api::{
    ContextId, ContextKind, ContextRecord, DocumentBody, DocumentId, Role, StreamMetadata,
    TurnRequest, DEFAULT_CONVERSATION_TITLE, DEFAULT_WORK_TITLE,
};
