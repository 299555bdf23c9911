//! Prompts for VLM-based record extraction.
//!
//! Every prompt lives here so a wording change touches one file and the
//! tests below can pin the JSON contract the normalizer depends on.
//! Callers can override the extraction prompt via
//! [`crate::config::ExtractionConfig::system_prompt`].

/// Default system prompt: find every exercise on the page and answer in JSON.
///
/// The field names match [`crate::config::FieldMap::default`].
pub const DEFAULT_EXTRACTION_PROMPT: &str = r#"You are an expert at digitising printed exercise books. The image is one page of a textbook or problem collection.

Find EVERY exercise, problem, or task on the page and extract it.

RULES
1. Include each task's full text: statement, given data, and question, with every number and mathematical expression.
2. task_number is the number printed next to the task. If it is missing or unreadable, use "unknown".
3. has_image is true when the task has a picture, diagram, table, chart, or figure.
4. confidence is your certainty that the extraction is correct, from 0 to 1.
5. Ignore running headers, page numbers, and the book title.
6. Each task must be complete and self-contained.

RESPONSE FORMAT (strict JSON)
{
  "tasks": [
    {
      "task_number": "1",
      "task_text": "Full text of the task...",
      "has_image": false,
      "confidence": 0.95
    }
  ],
  "page_info": {
    "total_tasks": 1,
    "processing_notes": "optional notes"
  }
}

Reply with ONLY the JSON object. No markdown fences, no commentary before or after."#;

/// Simpler prompt used once when the reply to the default prompt cannot be
/// parsed as JSON.
pub const FALLBACK_PROMPT: &str = r#"List the exercises on this textbook page.

Reply with one JSON object and nothing else:
{"tasks": [{"task_number": "1", "task_text": "text of the exercise", "has_image": false}]}

Use "unknown" when a number is not visible. Use an empty "tasks" list if the page has no exercises."#;

/// User-turn text sent with the page image.
pub fn unit_prompt(unit_num: usize) -> String {
    format!("Page {unit_num}. Extract the tasks from this page.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FieldMap;

    #[test]
    fn prompts_name_the_default_fields() {
        let fields = FieldMap::default();
        for prompt in [DEFAULT_EXTRACTION_PROMPT, FALLBACK_PROMPT] {
            assert!(prompt.contains(&fields.items));
            assert!(prompt.contains(&fields.key));
            assert!(prompt.contains(&fields.text));
            assert!(prompt.contains(&fields.visual));
        }
        assert!(DEFAULT_EXTRACTION_PROMPT.contains(&fields.expected_count));
    }

    #[test]
    fn unit_prompt_is_one_indexed() {
        assert_eq!(unit_prompt(3), "Page 3. Extract the tasks from this page.");
    }
}
