//! Go 包（单个目录）的加载与索引

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use testfleet_core::{FleetError, FleetResult};
use tracing::{debug, warn};
use tree_sitter::{Node, Parser, Tree};

use crate::decl::{extract_declarations, is_test_name, Declaration, DeclKind, TestRole};

/// 名称出现位置的语法形态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteKind {
    /// 裸标识符：调用、取值、类型转换
    Identifier,
    /// `x.Name`，操作数是普通标识符（例如包名）时 `qualified` 为 true
    Selector { qualified: bool },
    /// 类型位置，包括 `pkg.Type` 中的类型名
    TypeName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub file: usize,
    pub offset: usize,
    pub site: SiteKind,
}

#[derive(Debug)]
pub struct SourceFile {
    pub path: PathBuf,
    pub is_test: bool,
    pub text: String,
}

impl SourceFile {
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }
}

/// 解析后的包：顶层声明，以及按名称索引的全部出现位置
#[derive(Debug)]
pub struct Package {
    pub directory: PathBuf,
    pub files: Vec<SourceFile>,
    /// 按文件分组，按起始偏移排序
    declarations: Vec<Vec<Declaration>>,
    roles: HashMap<(usize, usize), TestRole>,
    occurrences: HashMap<String, Vec<Occurrence>>,
}

fn go_parser() -> FleetResult<Parser> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_go::LANGUAGE.into())
        .map_err(|e| FleetError::Parse(format!("加载Go语法失败: {e}")))?;
    Ok(parser)
}

fn record(
    out: &mut HashMap<String, Vec<Occurrence>>,
    text: &str,
    file: usize,
    node: Node<'_>,
    site: SiteKind,
) {
    let name = text.get(node.start_byte()..node.end_byte()).unwrap_or("");
    if name.is_empty() {
        return;
    }
    out.entry(name.to_string()).or_default().push(Occurrence {
        file,
        offset: node.start_byte(),
        site,
    });
}

fn collect_occurrences(
    tree: &Tree,
    text: &str,
    file: usize,
    out: &mut HashMap<String, Vec<Occurrence>>,
) {
    let mut cursor = tree.walk();
    loop {
        let node = cursor.node();
        match node.kind() {
            "identifier" => record(out, text, file, node, SiteKind::Identifier),
            "type_identifier" => record(out, text, file, node, SiteKind::TypeName),
            "selector_expression" => {
                if let Some(field) = node.child_by_field_name("field") {
                    let qualified = node
                        .child_by_field_name("operand")
                        .map(|operand| operand.kind() == "identifier")
                        .unwrap_or(false);
                    record(out, text, file, field, SiteKind::Selector { qualified });
                }
            }
            _ => {}
        }

        if cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return;
            }
        }
    }
}

impl Package {
    /// 解析 `directory` 下直接包含的所有 `.go` 文件
    pub fn load(directory: &Path) -> FleetResult<Self> {
        let entries = fs::read_dir(directory).map_err(|e| {
            FleetError::InvalidRequest(format!(
                "无法读取包目录 {}: {e}",
                directory.display()
            ))
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("go"))
            .collect();
        paths.sort();

        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let text = fs::read_to_string(&path)?;
            let is_test = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with("_test.go"))
                .unwrap_or(false);
            files.push(SourceFile { path, is_test, text });
        }

        Self::from_files(directory.to_path_buf(), files)
    }

    pub fn from_files(directory: PathBuf, files: Vec<SourceFile>) -> FleetResult<Self> {
        let mut parser = go_parser()?;
        let mut declarations = Vec::with_capacity(files.len());
        let mut extracted_all = Vec::new();
        let mut occurrences = HashMap::new();

        for (index, file) in files.iter().enumerate() {
            let tree = parser.parse(&file.text, None).ok_or_else(|| {
                FleetError::Parse(format!("解析 {} 未返回语法树", file.path.display()))
            })?;
            if tree.root_node().has_error() {
                warn!("{} 存在语法错误，分析结果可能不完整", file.path.display());
            }

            let extracted = extract_declarations(tree.root_node(), &file.text, index);
            let mut decls: Vec<Declaration> = extracted.iter().map(|e| e.decl.clone()).collect();
            decls.sort_by_key(|d| d.start);
            declarations.push(decls);
            extracted_all.extend(extracted);

            collect_occurrences(&tree, &file.text, index, &mut occurrences);
        }

        let suite_types: Vec<String> = extracted_all
            .iter()
            .filter(|e| e.is_suite_type && files[e.decl.file].is_test)
            .map(|e| e.decl.name.clone())
            .collect();

        let mut roles = HashMap::new();
        for extracted in &extracted_all {
            let decl = &extracted.decl;
            if !files[decl.file].is_test {
                continue;
            }
            let role = match &decl.kind {
                DeclKind::Function if extracted.takes_testing_t && is_test_name(&decl.name) => {
                    TestRole::TestFunction
                }
                DeclKind::Method { receiver } if suite_types.contains(receiver) => {
                    TestRole::SuiteMethod {
                        suite: receiver.clone(),
                    }
                }
                _ => continue,
            };
            roles.insert(decl.key(), role);
        }

        debug!(
            "已加载包 {} ({} 个文件, {} 个测试套件)",
            directory.display(),
            files.len(),
            suite_types.len()
        );

        Ok(Self {
            directory,
            files,
            declarations,
            roles,
            occurrences,
        })
    }

    pub fn file_index(&self, path: &Path) -> Option<usize> {
        let wanted = path.file_name()?;
        self.files
            .iter()
            .position(|f| f.path.file_name() == Some(wanted))
    }

    pub fn declarations(&self, file: usize) -> &[Declaration] {
        self.declarations.get(file).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 包含 `offset` 的顶层声明
    pub fn enclosing(&self, file: usize, offset: usize) -> Option<&Declaration> {
        let decls = self.declarations(file);
        let idx = decls.partition_point(|d| d.start <= offset);
        idx.checked_sub(1)
            .map(|i| &decls[i])
            .filter(|d| d.contains(offset))
    }

    pub fn role(&self, decl: &Declaration) -> &TestRole {
        self.roles.get(&decl.key()).unwrap_or(&TestRole::None)
    }

    pub fn occurrences(&self, name: &str) -> &[Occurrence] {
        self.occurrences.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 包内按名称引用了 `decl` 的声明
    pub fn referrers(&self, decl: &Declaration) -> Vec<&Declaration> {
        let mut found: Vec<&Declaration> = Vec::new();
        for occurrence in self.occurrences(&decl.name) {
            if !decl.kind.matches(occurrence.site) {
                continue;
            }
            let Some(enclosing) = self.enclosing(occurrence.file, occurrence.offset) else {
                continue;
            };
            if enclosing.key() == decl.key() {
                continue;
            }
            if !found.iter().any(|d| d.key() == enclosing.key()) {
                found.push(enclosing);
            }
        }
        found
    }

    /// 启动指定套件的测试函数，例如 `suite.Run(t, new(S))`
    pub fn suite_runners(&self, suite: &str) -> Vec<&Declaration> {
        self.occurrences(suite)
            .iter()
            .filter(|o| matches!(o.site, SiteKind::TypeName | SiteKind::Identifier))
            .filter_map(|o| self.enclosing(o.file, o.offset))
            .filter(|d| *self.role(d) == TestRole::TestFunction)
            .fold(Vec::new(), |mut acc: Vec<&Declaration>, d| {
                if !acc.iter().any(|seen| seen.key() == d.key()) {
                    acc.push(d);
                }
                acc
            })
    }

    /// 所有可运行的测试函数，按名称排序
    pub fn test_functions(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .declarations
            .iter()
            .flatten()
            .filter(|d| *self.role(d) == TestRole::TestFunction)
            .map(|d| d.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
