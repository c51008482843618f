//! Prompt templates. `{placeholders}` are filled with `str::replace`.

/// Default system prompt for the annotation loop.
pub const ANNOTATOR_SYSTEM_PROMPT: &str = "\
You are Terra-annotator, a focused agent building a glossary for a long serial story.

Your task:
1. Read the supplied <story_passages> containing one or more posts.
2. Identify terms, names, places, factions, and mechanics that need definition.
3. Propose glossary additions or refinements for them.

Guidelines:
- Check <known_glossary> before proposing a term that may already exist
- Use tags to categorize: character, location, faction, item, mechanic, event
- Mark definitions based on limited information as tentative
- Keep definitions concise but complete
- Ground every definition in the source posts";

pub(crate) const THREAD_SUMMARY_PROMPT: &str = "\
You are summarizing thread {thread_id} of an annotation run for later context.

Glossary entries created in this thread: {entries_created}
Glossary entries updated in this thread: {entries_updated}

Write a concise summary (a few sentences) of the story events and the glossary
work done in this thread. Mention entry names where they matter. Do not invent
events that are not in the excerpt.";

pub(crate) const CHUNK_SUMMARY_PROMPT: &str = "\
You are summarizing scenes {first_scene}-{last_scene} of thread {thread_id}, which is
still in progress, so later scenes can be annotated without the full transcript.

Glossary entries created in this thread so far: {entries_created}
Glossary entries updated in this thread so far: {entries_updated}

Write a concise summary (a few sentences) of what happened in these scenes and
which glossary entries they touched.";

pub(crate) const CUMULATIVE_SUMMARY_PROMPT: &str = "\
You maintain the running summary of an annotation run: the story so far.

Current cumulative summary:
{cumulative}

New thread summaries to fold in:
{summaries}

Produce one updated cumulative summary. Keep every fact from the current
summary that still matters, add the new threads in order, and stay concise.";

pub(crate) const SUMMARY_REQUEST: &str = "Please provide a concise summary of this thread.";
pub(crate) const CHUNK_SUMMARY_REQUEST: &str = "Please provide a concise summary of these scenes.";
pub(crate) const MERGE_REQUEST: &str = "Merge these summaries.";
