mod agent_client;
mod compaction;
mod persistence;
