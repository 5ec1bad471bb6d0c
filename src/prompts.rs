//! Prompts for every inference task the pipeline issues.
//!
//! Keeping them in one place means a schema change touches exactly one file,
//! and unit tests can check the prompts without calling a model.

/// System prompt for layout detection. The model must answer with JSON only.
pub const DETECT_LAYOUT_PROMPT: &str = r#"You are a document layout analyser. You receive one rendered PDF page.

Identify every visually distinct region on the page and classify it as one of:
- "table"      : a grid of cells with rows and columns
- "chart"      : a plot or graph (bar, line, pie, scatter, area, ...)
- "figure"     : any other image, diagram, photo or illustration
- "text_block" : a paragraph, heading, list or caption

Respond with a single JSON object and nothing else:

{
  "elements": [
    {
      "kind": "table" | "chart" | "figure" | "text_block",
      "bbox": [x0, y0, x1, y1],
      "confidence": 0.0-1.0,
      "title": "visible title or heading of the region, or null",
      "text": "transcribed text for text_block regions, otherwise null"
    }
  ]
}

Rules:
1. bbox uses normalised page coordinates: (0,0) is the top-left corner, (1,1) the bottom-right.
2. x0 < x1 and y0 < y1. Boxes must lie inside the page.
3. Report each region once. Do not nest a region inside another of the same kind.
4. Include the region's caption in "title" when it names the table, chart or figure.
5. If the page has no regions, return {"elements": []}.
6. Do NOT wrap the JSON in markdown fences. Do NOT add commentary."#;

/// Instruction sent with the page image for layout detection.
pub fn detect_layout_instruction(page_index: usize) -> String {
    format!("Detect the layout regions of page {}.", page_index + 1)
}

/// System prompt for reconstructing a table crop as markup.
pub const STRUCTURE_TABLE_PROMPT: &str = r#"You are given an image of a single table cropped from a PDF page.

Reconstruct the table as a GitHub-flavoured Markdown pipe table:
1. The first row is the header row; follow it with a separator row (| --- |).
2. Keep every cell value exactly as printed, including units, signs and footnote markers.
3. Merged cells: repeat the value in each spanned cell.
4. Empty cells stay empty (| |).
5. If the table has a title, put it on its own line above the table in bold.

Output ONLY the table. Do NOT wrap it in fences. Do NOT add commentary."#;

/// System prompt for best-effort captions of charts and figures.
pub const CAPTION_PROMPT: &str = "Describe this image in detail. If it's a chart or table, \
summarize the key data points. Answer in at most five sentences of plain text.";

/// System prompt for model-based query intent classification.
pub const CLASSIFY_INTENT_PROMPT: &str = r#"You route questions about a PDF document to the right kind of context.

Classify the user's question and respond with one JSON object and nothing else:

{
  "intent": "text_only" | "specific_visual" | "broad_visual" | "data_grounded",
  "visual_type": "table" | "chart" | "figure" | null,
  "reason": "one short sentence"
}

- specific_visual: the question names or describes one particular table, chart or figure
  (a unique subject or title), e.g. "show me the inflation chart".
- broad_visual: the question asks for a whole category without narrowing it,
  e.g. "show me all the tables", "list every figure".
- data_grounded: a factual or numeric question answered from the text where the
  source table or chart should be shown too, e.g. "what was GDP growth in 2023?".
- text_only: the question needs prose only, e.g. "summarise the introduction".

When unsure, answer "data_grounded". Do NOT wrap the JSON in fences."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_prompt_names_every_kind() {
        for kind in ["table", "chart", "figure", "text_block"] {
            assert!(DETECT_LAYOUT_PROMPT.contains(kind), "missing {kind}");
        }
        assert!(DETECT_LAYOUT_PROMPT.contains("\"bbox\""));
    }

    #[test]
    fn intent_prompt_lists_all_intents() {
        for intent in ["text_only", "specific_visual", "broad_visual", "data_grounded"] {
            assert!(CLASSIFY_INTENT_PROMPT.contains(intent));
        }
    }

    #[test]
    fn instruction_uses_one_based_page_numbers() {
        assert!(detect_layout_instruction(0).contains("page 1"));
    }
}
