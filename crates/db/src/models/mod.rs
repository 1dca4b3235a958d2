pub mod environment;
pub mod worktree;
