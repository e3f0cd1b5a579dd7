//! Transitive dependency resolution over a repository index.
//!
//! The resolver expands a requested package set into its full closure,
//! honoring `provides` capabilities, alternatives (`a | b | c`),
//! architecture qualifiers and version constraints, and emits a
//! deterministic install order: dependencies before dependents,
//! lexicographic within a layer.

use std::{
	cmp::Reverse,
	collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque},
	path::Path,
};

use indexmap::IndexMap;
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::{
	errors::{Error, Result},
	repo::PackageInfo,
	util::just_write,
};

/// A resolved closure: install order plus the dependency edges that
/// produced it (dependent -> dependency), kept for the graph export.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
	pub order: Vec<PackageInfo>,
	pub edges: Vec<(String, String)>,
}

impl Resolution {
	#[must_use]
	pub fn names(&self) -> Vec<&str> {
		self.order.iter().map(|p| p.name.as_str()).collect()
	}
}

/// Normalize a dependency expression to a bare lookup key:
///
/// - `pkg:amd64 (>= 1.0) | alt` -> `pkg` (first alternative)
/// - `pkg_1.0_amd64` -> `pkg=1.0` (deb filename form)
/// - `  x  ` -> `x`
#[must_use]
pub fn normalize(dep: &str) -> String {
	let first_alt = dep.split('|').next().unwrap_or(dep).trim();

	// deb filename form: name_version[_arch]
	let parts: Vec<&str> = first_alt.split('_').collect();
	if parts.len() >= 2
		&& !parts[0].is_empty()
		&& parts[1].chars().next().is_some_and(|c| c.is_ascii_digit())
	{
		return format!("{}={}", parts[0], parts[1]);
	}

	let no_constraint = strip_version_parens(first_alt);
	let no_arch = no_constraint.split(':').next().unwrap_or(&no_constraint);
	no_arch.trim().to_owned()
}

/// Remove parenthesized version constraints (`(>= 1.0)`), leaving
/// capability parens (`config(bash)`, `pkgconfig(zlib)`) alone: only a
/// group whose content starts with a comparison operator is a
/// constraint.
fn strip_version_parens(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	let mut rest = s;
	while let Some(open) = rest.find('(') {
		let Some(close_rel) = rest[open..].find(')') else {
			out.push_str(rest);
			return out.trim().to_owned();
		};
		let close = open + close_rel;
		let inner = rest[open + 1..close].trim_start();
		if inner.starts_with('<') || inner.starts_with('>') || inner.starts_with('=') || inner.starts_with('~') {
			out.push_str(&rest[..open]);
		} else {
			out.push_str(&rest[..=close]);
		}
		rest = &rest[close + 1..];
	}
	out.push_str(rest);
	out.trim().to_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerOp {
	Lt,
	Le,
	Eq,
	Ge,
	Gt,
}

impl VerOp {
	fn parse(s: &str) -> Option<Self> {
		match s {
			"<<" | "<" => Some(Self::Lt),
			"<=" => Some(Self::Le),
			"=" | "==" => Some(Self::Eq),
			">=" => Some(Self::Ge),
			">>" | ">" => Some(Self::Gt),
			_ => None,
		}
	}

	fn matches(self, ord: std::cmp::Ordering) -> bool {
		use std::cmp::Ordering::{Equal, Greater, Less};
		match self {
			Self::Lt => ord == Less,
			Self::Le => ord != Greater,
			Self::Eq => ord == Equal,
			Self::Ge => ord != Less,
			Self::Gt => ord == Greater,
		}
	}
}

/// Split a raw (single-alternative) expression into its lookup name and
/// optional version constraint: `name (op ver)`, `name=ver`, bare name.
/// Capability parens are part of the name.
fn parse_constraint(expr: &str) -> Result<(String, Option<(VerOp, String)>)> {
	let expr = expr.trim();

	// find a paren group whose content is a version constraint
	let mut search = 0usize;
	while let Some(open_rel) = expr[search..].find('(') {
		let open = search + open_rel;
		let Some(close_rel) = expr[open..].find(')') else {
			return Err(Error::Unresolvable {
				name: expr.to_owned(),
				reason: "unterminated version constraint".to_owned(),
			});
		};
		let close = open + close_rel;
		let inner = expr[open + 1..close].trim();
		if inner.starts_with('<') || inner.starts_with('>') || inner.starts_with('=') || inner.starts_with('~') {
			let name = normalize(&expr[..open]);
			let mut it = inner.split_whitespace();
			let (Some(op_s), Some(ver)) = (it.next(), it.next()) else {
				return Err(Error::Unresolvable {
					name: expr.to_owned(),
					reason: "malformed version constraint".to_owned(),
				});
			};
			let Some(op) = VerOp::parse(op_s) else {
				return Err(Error::Unresolvable {
					name: expr.to_owned(),
					reason: format!("unknown version operator `{op_s}`"),
				});
			};
			return Ok((name, Some((op, ver.to_owned()))));
		}
		search = close + 1;
	}

	// no version group: normalize first, so the deb filename form
	// (`name_ver_arch` -> `name=ver`) also lands in the `=` branch
	let name = normalize(expr);
	if !expr.contains('(') {
		if let Some((n, ver)) = name.split_once('=') {
			return Ok((n.trim().to_owned(), Some((VerOp::Eq, ver.trim().to_owned()))));
		}
	}
	Ok((name, None))
}

/// Segment-wise version comparison good enough for both families:
/// an optional numeric epoch before `:`, then alternating numeric and
/// alphabetic runs compared numerically and lexically.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
	fn split_epoch(v: &str) -> (u64, &str) {
		match v.split_once(':') {
			Some((e, rest)) => (e.parse().unwrap_or(0), rest),
			None => (0, v),
		}
	}
	fn segments(v: &str) -> Vec<(bool, String)> {
		let mut out: Vec<(bool, String)> = Vec::new();
		for c in v.chars() {
			if c == '.' || c == '-' || c == '~' || c == '+' {
				out.push((false, String::new()));
				continue;
			}
			let numeric = c.is_ascii_digit();
			match out.last_mut() {
				Some((n, s)) if *n == numeric && !s.is_empty() => s.push(c),
				_ => out.push((numeric, c.to_string())),
			}
		}
		out.retain(|(_, s)| !s.is_empty());
		out
	}

	let (ea, ra) = split_epoch(a);
	let (eb, rb) = split_epoch(b);
	if ea != eb {
		return ea.cmp(&eb);
	}
	let sa = segments(ra);
	let sb = segments(rb);
	for pair in sa.iter().zip_longest(sb.iter()) {
		use itertools::EitherOrBoth;
		match pair {
			EitherOrBoth::Both((na, va), (nb, vb)) => {
				let ord = if *na && *nb {
					let x: u128 = va.parse().unwrap_or(0);
					let y: u128 = vb.parse().unwrap_or(0);
					x.cmp(&y)
				} else {
					va.cmp(vb)
				};
				if ord != std::cmp::Ordering::Equal {
					return ord;
				}
			},
			EitherOrBoth::Left(_) => return std::cmp::Ordering::Greater,
			EitherOrBoth::Right(_) => return std::cmp::Ordering::Less,
		}
	}
	std::cmp::Ordering::Equal
}

struct Index<'a> {
	/// name -> records in index read order; the last one wins absent a
	/// disambiguating constraint
	by_name: IndexMap<&'a str, Vec<&'a PackageInfo>>,
	/// capability -> provider names, ordered for lexicographic tie-break
	provides: HashMap<&'a str, BTreeSet<&'a str>>,
}

impl<'a> Index<'a> {
	fn build(all: &'a [PackageInfo]) -> Self {
		let mut by_name: IndexMap<&str, Vec<&PackageInfo>> = IndexMap::new();
		let mut provides: HashMap<&str, BTreeSet<&str>> = HashMap::new();
		for pkg in all {
			by_name.entry(pkg.name.as_str()).or_default().push(pkg);
			for cap in &pkg.provides {
				provides.entry(cap.trim()).or_default().insert(pkg.name.as_str());
			}
		}
		Self { by_name, provides }
	}

	/// Resolve one (normalized) name to the package that satisfies it:
	/// direct index hit first, then the lexicographically first provider.
	fn satisfy(&self, name: &str, constraint: Option<&(VerOp, String)>) -> Option<&'a PackageInfo> {
		if let Some(candidates) = self.by_name.get(name) {
			return match constraint {
				None => candidates.last().copied(),
				Some((op, ver)) => candidates
					.iter()
					.rev()
					.find(|p| op.matches(compare_versions(&p.version, ver)))
					.copied(),
			};
		}
		self.provides
			.get(name)
			.and_then(|providers| providers.iter().next())
			.and_then(|provider| self.by_name.get(provider))
			.and_then(|c| c.last().copied())
	}
}

/// Compute the transitive closure of `requested` over `all` and return
/// it in install order.
///
/// # Errors
/// `UnresolvableError` for missing roots, unsatisfiable transitive
/// dependencies and malformed version expressions.
pub fn resolve(requested: &[String], all: &[PackageInfo]) -> Result<Resolution> {
	let index = Index::build(all);
	let mut selected: IndexMap<String, PackageInfo> = IndexMap::new();
	let mut queue: VecDeque<String> = VecDeque::new();

	for root in requested {
		let (name, constraint) = parse_constraint(root)?;
		let Some(pkg) = index.satisfy(&name, constraint.as_ref()) else {
			return Err(Error::Unresolvable { name, reason: "not in index".to_owned() });
		};
		if selected.insert(pkg.name.clone(), pkg.clone()).is_none() {
			queue.push_back(pkg.name.clone());
		}
	}

	// breadth-first closure walk; the visited set (`selected`) breaks cycles
	while let Some(current) = queue.pop_front() {
		let requires = selected
			.get(&current)
			.map(|p| p.requires_ver.clone())
			.unwrap_or_default();
		for expr in &requires {
			match choose(&index, expr)? {
				Chosen::Package(pkg) => {
					let pkg = pkg.clone();
					if !selected.contains_key(&pkg.name) {
						queue.push_back(pkg.name.clone());
						selected.insert(pkg.name.clone(), pkg);
					}
				},
				Chosen::Dropped => {},
			}
		}
	}

	let (order, edges) = topo_order(&index, &selected)?;
	info!(requested = requested.len(), closure = order.len(), "resolved package closure");
	Ok(Resolution { order, edges })
}

enum Chosen<'a> {
	Package(&'a PackageInfo),
	Dropped,
}

/// Resolve a raw dependency expression, including alternatives.
fn choose<'a>(index: &Index<'a>, expr: &str) -> Result<Chosen<'a>> {
	let alternatives: Vec<&str> = expr.split('|').map(str::trim).filter(|s| !s.is_empty()).collect();
	let is_alternative = alternatives.len() > 1;

	for alt in &alternatives {
		let (name, constraint) = parse_constraint(alt)?;
		if let Some(pkg) = index.satisfy(&name, constraint.as_ref()) {
			return Ok(Chosen::Package(pkg));
		}
	}

	if is_alternative {
		warn!(expr, "no alternative present in index, dropping dependency");
		return Ok(Chosen::Dropped);
	}
	let (name, _) = parse_constraint(expr)?;
	Err(Error::Unresolvable { name, reason: "no package or provider in index".to_owned() })
}

/// Deterministic topological order: Kahn's algorithm with a
/// lexicographic ready-heap; cycles are broken by force-emitting the
/// smallest blocked node.
fn topo_order(
	index: &Index<'_>, selected: &IndexMap<String, PackageInfo>,
) -> Result<(Vec<PackageInfo>, Vec<(String, String)>)> {
	// name -> set of dependency names inside the closure
	let mut deps: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
	let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
	let mut edges: Vec<(String, String)> = Vec::new();

	for (name, pkg) in selected {
		deps.entry(name.as_str()).or_default();
		for expr in &pkg.requires_ver {
			let Ok(Chosen::Package(dep)) = choose(index, expr) else { continue };
			if dep.name == *name || !selected.contains_key(&dep.name) {
				continue;
			}
			// dep must land before name
			let dep_name = selected.get(&dep.name).map_or(dep.name.as_str(), |p| p.name.as_str());
			if deps.entry(name.as_str()).or_default().insert(dep_name) {
				edges.push((name.clone(), dep_name.to_owned()));
			}
			dependents.entry(dep_name).or_default().insert(name.as_str());
		}
	}

	let mut indegree: BTreeMap<&str, usize> = deps.iter().map(|(n, d)| (*n, d.len())).collect();
	let mut heap: BinaryHeap<Reverse<&str>> = indegree
		.iter()
		.filter(|(_, d)| **d == 0)
		.map(|(n, _)| Reverse(*n))
		.collect();

	let mut ordered: Vec<&str> = Vec::with_capacity(selected.len());
	let mut emitted: HashSet<&str> = HashSet::new();

	while ordered.len() < selected.len() {
		let next = if let Some(Reverse(n)) = heap.pop() {
			if emitted.contains(n) {
				continue;
			}
			n
		} else {
			// dependency cycle: force the smallest blocked node out
			let mut best: Option<(usize, &str)> = None;
			for (n, d) in &indegree {
				if emitted.contains(n) {
					continue;
				}
				let key = (*d, *n);
				if best.map_or(true, |b| key < b) {
					best = Some(key);
				}
			}
			let Some((_, candidate)) = best else { break };
			debug!(node = candidate, "breaking dependency cycle");
			candidate
		};

		emitted.insert(next);
		ordered.push(next);
		if let Some(users) = dependents.get(next) {
			for user in users {
				if let Some(d) = indegree.get_mut(user) {
					*d = d.saturating_sub(1);
					if *d == 0 && !emitted.contains(user) {
						heap.push(Reverse(*user));
					}
				}
			}
		}
	}

	let order = ordered
		.into_iter()
		.filter_map(|n| selected.get(n).cloned())
		.collect::<Vec<_>>();
	if order.len() != selected.len() {
		return Err(Error::Unresolvable {
			name: "<closure>".to_owned(),
			reason: "internal ordering lost packages".to_owned(),
		});
	}
	Ok((order, edges))
}

/// Write the Graphviz and JSON closure exports next to the package
/// cache. Operator diagnostics only: failures are reported, not fatal.
pub fn export_graph(cache_dir: &Path, resolution: &Resolution) {
	let dot_path = cache_dir.join("chrootpkgs.dot");
	let mut dot = String::from("digraph chrootpkgs {\n");
	for pkg in &resolution.order {
		dot.push_str(&format!("  \"{}\";\n", pkg.name));
	}
	for (from, to) in &resolution.edges {
		dot.push_str(&format!("  \"{from}\" -> \"{to}\";\n"));
	}
	dot.push_str("}\n");
	if let Err(e) = just_write(&dot_path, dot) {
		warn!(?dot_path, %e, "cannot write resolver graph");
	}

	let json_path = cache_dir.join("closure.json");
	match serde_json::to_vec_pretty(&resolution.order) {
		Ok(json) => {
			if let Err(e) = just_write(&json_path, json) {
				warn!(?json_path, %e, "cannot write closure manifest");
			}
		},
		Err(e) => warn!(%e, "cannot serialize closure manifest"),
	}
}
