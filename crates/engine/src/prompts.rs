//! Prompt builders. Kept compact: the planner gets a bounded window of run
//! state, the synthesizer gets the citation-tagged evidence.

use crate::planner::PlannerContext;

pub(crate) fn planner_prompt(ctx: &PlannerContext) -> String {
    let mut text = String::new();
    text.push_str("You are a retrieval planner answering questions over a document tree.\n");
    text.push_str("Propose exactly one next action as a single JSON object.\n");
    text.push_str(
        "Allowed kinds: search, inspect, expand_neighbors, synthesize, self_check, finish.\n",
    );
    text.push_str("Params: search{query}, inspect{node_id}, expand_neighbors{node_id, direction: parent|children|siblings}.\n");
    text.push_str("Only synthesize or finish once enough evidence has been collected.\n\n");

    text.push_str("QUERY:\n");
    text.push_str(&ctx.query);
    text.push('\n');
    text.push_str(&format!(
        "\nSTATE: phase={} step={}/{} evidence_nodes={} last_confidence={}\n",
        ctx.phase.as_str(),
        ctx.step_index,
        ctx.max_steps,
        ctx.evidence_count,
        ctx.last_confidence
            .map(|value| format!("{value:.2}"))
            .unwrap_or_else(|| "none".to_string()),
    ));

    if !ctx.explored_titles.is_empty() {
        text.push_str("\nEXPLORED SECTIONS:\n");
        for title in &ctx.explored_titles {
            text.push_str(&format!("- {title}\n"));
        }
    }

    if !ctx.recent_observations.is_empty() {
        text.push_str("\nRECENT OBSERVATIONS:\n");
        for observation in &ctx.recent_observations {
            text.push_str(&format!("- {observation}\n"));
        }
    }

    if !ctx.revision_gaps.is_empty() {
        text.push_str("\nTHE PREVIOUS ANSWER WAS REJECTED. Gaps to close:\n");
        for gap in &ctx.revision_gaps {
            text.push_str(&format!("- {gap}\n"));
        }
    }

    text.push_str("\nOutput format:\n");
    text.push_str(
        "{\"kind\":\"search\",\"objective\":\"...\",\"reasoning\":\"...\",\"params\":{\"query\":\"...\"},\"stop\":false}\n",
    );
    text
}

pub(crate) fn synthesis_prompt(query: &str, evidence: &[String], gaps: &[String]) -> String {
    let mut text = String::new();
    text.push_str("You are a retrieval reasoner. Answer only from the provided evidence.\n");
    text.push_str("Return compact markdown with direct citations in a JSON block.\n\n");
    text.push_str("USER QUERY:\n");
    text.push_str(query);
    text.push_str("\n\nEVIDENCE:\n");
    for (index, item) in evidence.iter().enumerate() {
        text.push_str(&format!("{}. {item}\n", index + 1));
    }
    if !gaps.is_empty() {
        text.push_str("\nA previous draft was rejected. Address these gaps:\n");
        for gap in gaps {
            text.push_str(&format!("- {gap}\n"));
        }
    }
    text.push_str("\nOutput format:\n");
    text.push_str("{\"answer_markdown\":\"...\",\"confidence\":0.0,\"citations\":[\"node-id\"]}\n");
    text
}
