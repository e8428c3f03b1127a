//! Go 顶层声明，以及每种声明的引用匹配规则

use tree_sitter::Node;

use crate::source::SiteKind;

/// testify 生命周期方法，修改后影响整个套件
const SUITE_LIFECYCLE_METHODS: &[&str] = &[
    "SetupSuite",
    "TearDownSuite",
    "SetupTest",
    "TearDownTest",
    "SetupSubTest",
    "TearDownSubTest",
    "BeforeTest",
    "AfterTest",
    "HandleStats",
];

/// 顶层声明种类
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeclKind {
    Function,
    Method { receiver: String },
    /// `var` 或 `const`，分组声明取第一个名称
    Value,
    Type,
}

impl DeclKind {
    /// 引用位置能否指向该种类的声明
    ///
    /// 方法选择器不区分接收者类型，`x.Name` 匹配所有名为 `Name` 的方法，
    /// 通过接口的调用也能被找到。
    pub fn matches(&self, site: SiteKind) -> bool {
        match self {
            DeclKind::Function | DeclKind::Value => matches!(
                site,
                SiteKind::Identifier | SiteKind::Selector { qualified: true }
            ),
            DeclKind::Method { .. } => matches!(site, SiteKind::Selector { .. }),
            DeclKind::Type => matches!(
                site,
                SiteKind::TypeName | SiteKind::Identifier | SiteKind::Selector { qualified: true }
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Declaration {
    pub name: String,
    pub kind: DeclKind,
    /// 包内文件列表的下标
    pub file: usize,
    pub start: usize,
    /// 不含
    pub end: usize,
}

impl Declaration {
    pub fn contains(&self, offset: usize) -> bool {
        self.start <= offset && offset < self.end
    }

    /// 与闭区间 `begin..=end` 有重叠
    pub fn overlaps(&self, begin: usize, end: usize) -> bool {
        self.start <= end && begin < self.end
    }

    pub fn key(&self) -> (usize, usize) {
        (self.file, self.start)
    }
}

/// 声明在 `go test` 中的角色
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestRole {
    /// `_test.go` 文件中的 `func TestXxx(t *testing.T)`
    TestFunction,
    /// 测试文件中 testify 套件的方法
    SuiteMethod { suite: String },
    None,
}

pub(crate) fn is_lifecycle_method(name: &str) -> bool {
    SUITE_LIFECYCLE_METHODS.contains(&name)
}

/// `TestXxx`，其中 `Xxx` 不以小写字母开头
pub(crate) fn is_test_name(name: &str) -> bool {
    match name.strip_prefix("Test") {
        Some(rest) => !rest.starts_with(|c: char| c.is_lowercase()),
        None => false,
    }
}

pub(crate) fn node_text<'a>(node: Node<'_>, text: &'a str) -> &'a str {
    text.get(node.start_byte()..node.end_byte()).unwrap_or("")
}

fn first_descendant<'t>(node: Node<'t>, kinds: &[&str]) -> Option<Node<'t>> {
    let mut cursor = node.walk();
    let mut stack = vec![node];
    while let Some(current) = stack.pop() {
        if kinds.contains(&current.kind()) {
            return Some(current);
        }
        let children: Vec<Node<'t>> = current.named_children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
    }
    None
}

fn first_spec_name(node: Node<'_>, spec_kinds: &[&str], text: &str) -> Option<String> {
    let spec = first_descendant(node, spec_kinds)?;
    let name = spec.child_by_field_name("name")?;
    Some(node_text(name, text).to_string())
}

/// 顶层声明及后续分类所需的信息
#[derive(Debug, Clone)]
pub(crate) struct ExtractedDecl {
    pub decl: Declaration,
    /// 参数列表包含 `*testing.T`
    pub takes_testing_t: bool,
    /// 内嵌 `suite.Suite` 的结构体
    pub is_suite_type: bool,
}

/// 按源码顺序收集单个文件的顶层声明
pub(crate) fn extract_declarations(root: Node<'_>, text: &str, file: usize) -> Vec<ExtractedDecl> {
    let mut cursor = root.walk();
    let mut decls = Vec::new();

    for child in root.named_children(&mut cursor) {
        let mut takes_testing_t = false;
        let mut is_suite_type = false;

        let named = match child.kind() {
            "function_declaration" => {
                takes_testing_t = child
                    .child_by_field_name("parameters")
                    .map(|params| node_text(params, text).contains("*testing.T"))
                    .unwrap_or(false);
                child
                    .child_by_field_name("name")
                    .map(|n| (node_text(n, text).to_string(), DeclKind::Function))
            }
            "method_declaration" => {
                let receiver = child
                    .child_by_field_name("receiver")
                    .and_then(|r| first_descendant(r, &["type_identifier"]))
                    .map(|t| node_text(t, text).to_string())
                    .unwrap_or_default();
                child
                    .child_by_field_name("name")
                    .map(|n| (node_text(n, text).to_string(), DeclKind::Method { receiver }))
            }
            "var_declaration" => {
                first_spec_name(child, &["var_spec"], text).map(|n| (n, DeclKind::Value))
            }
            "const_declaration" => {
                first_spec_name(child, &["const_spec"], text).map(|n| (n, DeclKind::Value))
            }
            "type_declaration" => {
                is_suite_type = node_text(child, text).contains("suite.Suite");
                first_spec_name(child, &["type_spec", "type_alias"], text)
                    .map(|n| (n, DeclKind::Type))
            }
            _ => None,
        };

        if let Some((name, kind)) = named {
            if name.is_empty() {
                continue;
            }
            decls.push(ExtractedDecl {
                decl: Declaration {
                    name,
                    kind,
                    file,
                    start: child.start_byte(),
                    end: child.end_byte(),
                },
                takes_testing_t,
                is_suite_type,
            });
        }
    }

    decls
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_test_name() {
        assert!(is_test_name("TestSum"));
        assert!(is_test_name("Test"));
        assert!(is_test_name("Test_sum"));
        assert!(!is_test_name("Testsum"));
        assert!(!is_test_name("helperTest"));
    }

    #[test]
    fn test_method_matches_any_selector() {
        let kind = DeclKind::Method {
            receiver: "Calc".to_string(),
        };
        assert!(kind.matches(SiteKind::Selector { qualified: false }));
        assert!(kind.matches(SiteKind::Selector { qualified: true }));
        assert!(!kind.matches(SiteKind::Identifier));
    }

    #[test]
    fn test_function_ignores_unqualified_selector() {
        assert!(DeclKind::Function.matches(SiteKind::Identifier));
        assert!(DeclKind::Function.matches(SiteKind::Selector { qualified: true }));
        assert!(!DeclKind::Function.matches(SiteKind::Selector { qualified: false }));
        assert!(!DeclKind::Function.matches(SiteKind::TypeName));
    }

    #[test]
    fn test_type_matches_type_names() {
        assert!(DeclKind::Type.matches(SiteKind::TypeName));
        assert!(DeclKind::Type.matches(SiteKind::Identifier));
    }
}
