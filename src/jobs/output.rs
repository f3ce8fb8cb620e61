//! Pagination and truncation of job output.

/// Shape raw output for delivery.
///
/// With a positive `line_limit` the output is paginated, otherwise it is
/// capped at `max_lines`.
pub fn shape_output(output: &str, page: Option<usize>, line_limit: Option<usize>, max_lines: usize) -> String {
    match line_limit {
        Some(limit) if limit > 0 => paginate(output, page.unwrap_or(1), limit),
        _ => truncate(output, max_lines),
    }
}

/// Return one page of `output`. Pages past the end show the last page under a warning.
pub fn paginate(output: &str, page: usize, line_limit: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();
    let total_lines = lines.len();
    let limit = line_limit.max(1);
    let total_pages = total_lines.div_ceil(limit).max(1);

    let requested = page.max(1);
    let current = requested.min(total_pages);

    let mut shaped = String::new();
    if requested > total_pages {
        shaped.push_str(&format!(
            "Warning: page {} does not exist, showing page {} (the last page) instead.\n\n",
            requested, total_pages
        ));
    }

    let start = (current - 1) * limit;
    let end = (start + limit).min(total_lines);
    shaped.push_str(&lines[start..end].join("\n"));

    shaped.push_str(&format!(
        "\n\n[Showing page {} of {}, total lines {}]",
        current, total_pages, total_lines
    ));
    if current < total_pages {
        shaped.push_str(&format!(
            "\n[More output available: request page {} or narrow the query.]",
            current + 1
        ));
    }
    shaped
}

/// Keep at most `max_lines` lines, appending a trailer when anything was cut.
pub fn truncate(output: &str, max_lines: usize) -> String {
    let total_lines = output.lines().count();
    if total_lines <= max_lines {
        return output.to_string();
    }

    let kept: Vec<&str> = output.lines().take(max_lines).collect();
    format!(
        "{}\n[Output truncated: showing {} of {} lines. Set a line limit to page through the rest.]",
        kept.join("\n"),
        max_lines,
        total_lines
    )
}
