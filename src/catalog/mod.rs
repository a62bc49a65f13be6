//! Read-only problem catalog.
//!
//! Problems are opaque to the sync core: a session only carries the id of
//! the selected problem. The catalog ships with a built-in seed set and can
//! be replaced by a JSON file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid catalog JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Duplicate problem id: {0}")]
    DuplicateId(u32),

    #[error("Unknown sort key: {0}")]
    UnknownSort(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "easy" => Ok(Difficulty::Easy),
            "medium" => Ok(Difficulty::Medium),
            "hard" => Ok(Difficulty::Hard),
            other => Err(format!("unknown difficulty: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemExample {
    pub input: String,
    pub output: String,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: u32,
    pub title: String,
    pub difficulty: Difficulty,
    pub category: String,
    pub time_limit_minutes: u32,
    pub description: String,
    #[serde(default)]
    pub examples: Vec<ProblemExample>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// 0 to 100
    #[serde(default)]
    pub popularity: u32,
    /// Percentage of accepted submissions
    #[serde(default)]
    pub acceptance: u32,
}

impl Problem {
    /// Case-insensitive match against the title and tags
    pub fn matches_search(&self, term: &str) -> bool {
        let term = term.to_lowercase();
        self.title.to_lowercase().contains(&term)
            || self.tags.iter().any(|t| t.to_lowercase().contains(&term))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortKey {
    #[default]
    Popularity,
    Difficulty,
    Acceptance,
    Title,
    Category,
}

impl FromStr for SortKey {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "popularity" => Ok(SortKey::Popularity),
            "difficulty" => Ok(SortKey::Difficulty),
            "acceptance" => Ok(SortKey::Acceptance),
            "title" => Ok(SortKey::Title),
            "category" => Ok(SortKey::Category),
            other => Err(CatalogError::UnknownSort(other.to_string())),
        }
    }
}

/// Query over the catalog; empty fields match everything
#[derive(Debug, Clone, Default)]
pub struct ProblemFilter {
    pub difficulty: Option<Difficulty>,
    pub category: Option<String>,
    pub search: Option<String>,
    pub sort: SortKey,
}

impl ProblemFilter {
    pub fn with_difficulty(mut self, difficulty: Difficulty) -> Self {
        self.difficulty = Some(difficulty);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn sorted_by(mut self, sort: SortKey) -> Self {
        self.sort = sort;
        self
    }

    fn matches(&self, problem: &Problem) -> bool {
        self.difficulty.map_or(true, |d| problem.difficulty == d)
            && self
                .category
                .as_deref()
                .map_or(true, |c| problem.category.eq_ignore_ascii_case(c))
            && self
                .search
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map_or(true, |s| problem.matches_search(s.trim()))
    }
}

#[derive(Debug, Clone)]
pub struct ProblemCatalog {
    problems: Vec<Problem>,
}

impl ProblemCatalog {
    pub fn new(problems: Vec<Problem>) -> Result<Self, CatalogError> {
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = problems.iter().find(|p| !seen.insert(p.id)) {
            return Err(CatalogError::DuplicateId(dup.id));
        }
        Ok(Self { problems })
    }

    /// Load a catalog from a JSON array of problems
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let raw = fs::read_to_string(path)?;
        let problems: Vec<Problem> = serde_json::from_str(&raw)?;
        Self::new(problems)
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&Problem> {
        self.problems.iter().find(|p| p.id == id)
    }

    /// Sorted, distinct categories
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = self.problems.iter().map(|p| p.category.clone()).collect();
        categories.sort();
        categories.dedup();
        categories
    }

    pub fn query(&self, filter: &ProblemFilter) -> Vec<Problem> {
        let mut matched: Vec<Problem> = self
            .problems
            .iter()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();

        match filter.sort {
            SortKey::Popularity => matched.sort_by(|a, b| b.popularity.cmp(&a.popularity)),
            SortKey::Difficulty => matched.sort_by_key(|p| p.difficulty),
            SortKey::Acceptance => matched.sort_by(|a, b| b.acceptance.cmp(&a.acceptance)),
            SortKey::Title => matched.sort_by(|a, b| a.title.cmp(&b.title)),
            SortKey::Category => matched.sort_by(|a, b| a.category.cmp(&b.category)),
        }
        matched
    }

    /// The seed set shipped with the server
    pub fn builtin() -> Self {
        fn example(input: &str, output: &str, explanation: &str) -> ProblemExample {
            ProblemExample {
                input: input.to_string(),
                output: output.to_string(),
                explanation: explanation.to_string(),
            }
        }
        fn strings(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }

        let problems = vec![
            Problem {
                id: 1,
                title: "Remove Duplicates".to_string(),
                difficulty: Difficulty::Easy,
                category: "Array".to_string(),
                time_limit_minutes: 30,
                description: "Write a function that removes duplicate elements from an integer array.".to_string(),
                examples: vec![example(
                    "arr = [1,2,2,3,4,4,5]",
                    "[1,2,3,4,5]",
                    "Duplicates are removed and only unique values are returned.",
                )],
                constraints: strings(&["1 <= arr.length <= 10^4", "-10^3 <= arr[i] <= 10^3", "Order must be preserved"]),
                tags: strings(&["array", "hash-table"]),
                popularity: 95,
                acceptance: 87,
            },
            Problem {
                id: 2,
                title: "Valid Parentheses".to_string(),
                difficulty: Difficulty::Easy,
                category: "Stack".to_string(),
                time_limit_minutes: 25,
                description: "Decide whether a string of brackets is balanced.".to_string(),
                examples: vec![example("s = \"()\"", "true", "A matching pair of parentheses.")],
                constraints: strings(&["1 <= s.length <= 10^4", "s consists only of '(', ')', '{', '}', '[', ']'"]),
                tags: strings(&["stack", "string"]),
                popularity: 92,
                acceptance: 73,
            },
            Problem {
                id: 3,
                title: "Binary Tree Inorder".to_string(),
                difficulty: Difficulty::Medium,
                category: "Tree".to_string(),
                time_limit_minutes: 35,
                description: "Return the inorder traversal of a binary tree.".to_string(),
                examples: vec![example("root = [1,null,2,3]", "[1,3,2]", "Inorder: left, root, right.")],
                constraints: strings(&["The number of nodes is in [0, 100]", "-100 <= Node.val <= 100"]),
                tags: strings(&["tree", "dfs", "binary-tree"]),
                popularity: 88,
                acceptance: 65,
            },
            Problem {
                id: 4,
                title: "Maximum Subarray".to_string(),
                difficulty: Difficulty::Medium,
                category: "Dynamic Programming".to_string(),
                time_limit_minutes: 40,
                description: "Find the largest sum of a contiguous subarray.".to_string(),
                examples: vec![example(
                    "nums = [-2,1,-3,4,-1,2,1,-5,4]",
                    "6",
                    "[4,-1,2,1] has the largest sum, 6.",
                )],
                constraints: strings(&["1 <= nums.length <= 10^5", "-10^4 <= nums[i] <= 10^4"]),
                tags: strings(&["array", "dynamic-programming", "divide-and-conquer"]),
                popularity: 85,
                acceptance: 49,
            },
            Problem {
                id: 5,
                title: "Merge Two Lists".to_string(),
                difficulty: Difficulty::Easy,
                category: "Linked List".to_string(),
                time_limit_minutes: 30,
                description: "Merge two sorted linked lists into one sorted list.".to_string(),
                examples: vec![example(
                    "list1 = [1,2,4], list2 = [1,3,4]",
                    "[1,1,2,3,4,4]",
                    "Both lists are merged into one sorted list.",
                )],
                constraints: strings(&["Each list has between 0 and 50 nodes", "-100 <= Node.val <= 100"]),
                tags: strings(&["linked-list", "recursion"]),
                popularity: 90,
                acceptance: 61,
            },
            Problem {
                id: 6,
                title: "Climbing Stairs".to_string(),
                difficulty: Difficulty::Easy,
                category: "Dynamic Programming".to_string(),
                time_limit_minutes: 20,
                description: "Count the distinct ways to climb n stairs taking one or two steps at a time.".to_string(),
                examples: vec![example("n = 3", "3", "1+1+1, 1+2 and 2+1.")],
                constraints: strings(&["1 <= n <= 45"]),
                tags: strings(&["math", "dynamic-programming", "memoization"]),
                popularity: 93,
                acceptance: 52,
            },
        ];
        Self { problems }
    }
}

impl Default for ProblemCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
