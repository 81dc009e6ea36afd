//! `### Name ###` 分段文本协议的切片工具
//!
//! 模型回复按标记切段：某段从其标记之后开始，到后续任一标记出现为止；后续标记缺失时取到文本末尾。
//! 段内残留的 `###` 会被去掉。

/// 取 `marker` 之后、`next_markers` 中最早出现者之前的内容；marker 不存在时返回空串
pub fn extract_section(text: &str, marker: &str, next_markers: &[&str]) -> String {
    let Some(pos) = text.find(marker) else {
        return String::new();
    };
    let rest = &text[pos + marker.len()..];
    let end = next_markers
        .iter()
        .filter_map(|m| rest.find(m))
        .min()
        .unwrap_or(rest.len());
    rest[..end].replace("###", "").trim().to_string()
}

/// 去掉 Markdown 代码块围栏（```json / ```）
pub fn strip_code_fences(text: &str) -> String {
    text.replace("```json", "")
        .replace("```JSON", "")
        .replace("```", "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_between_markers() {
        let text = "### A ###\nalpha\n### B ###\nbeta\n### C ###\ngamma";
        assert_eq!(extract_section(text, "### A", &["### B", "### C"]), "alpha");
        assert_eq!(extract_section(text, "### B", &["### C"]), "beta");
        assert_eq!(extract_section(text, "### C", &[]), "gamma");
    }

    #[test]
    fn test_missing_markers() {
        assert_eq!(extract_section("no markers", "### A", &["### B"]), "");
        // 后续标记缺失：取到末尾
        assert_eq!(extract_section("### A ###\nalpha only", "### A", &["### B"]), "alpha only");
        // 后续标记乱序：取最早出现的那个
        assert_eq!(
            extract_section("### A ###\nx\n### C ###\ny\n### B ###\nz", "### A", &["### B", "### C"]),
            "x"
        );
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
    }
}
