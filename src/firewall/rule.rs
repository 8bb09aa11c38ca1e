// Typed packet-filter rule record. The record is the single source for the
// add, check and delete command forms; token-level rewrites only happen when
// reversing a rule recorded by an earlier run.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    Masquerade,
    /// Jump into a user-defined chain.
    Chain(String),
}

impl Verdict {
    pub fn target(&self) -> &str {
        match self {
            Verdict::Accept => "ACCEPT",
            Verdict::Drop => "DROP",
            Verdict::Masquerade => "MASQUERADE",
            Verdict::Chain(name) => name,
        }
    }
}

/// One packet-filter rule, either host-level or scoped to a namespace.
/// Every rule carries a `vpcctl:<info>` comment; the comment is part of the
/// rule's identity and what makes teardown deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub table: Table,
    pub chain: String,
    /// Insert at the head of the chain instead of appending.
    pub insert: bool,
    /// Run inside this network namespace instead of on the host.
    pub netns: Option<String>,
    pub in_iface: Option<String>,
    pub out_iface: Option<String>,
    pub source: Option<String>,
    pub dest: Option<String>,
    pub protocol: Option<String>,
    pub dport: Option<u16>,
    pub ct_state: Option<String>,
    pub comment: String,
    pub verdict: Verdict,
}

impl Rule {
    pub fn new(table: Table, chain: &str, verdict: Verdict, comment: String) -> Self {
        Self {
            table,
            chain: chain.to_string(),
            insert: false,
            netns: None,
            in_iface: None,
            out_iface: None,
            source: None,
            dest: None,
            protocol: None,
            dport: None,
            ct_state: None,
            comment,
            verdict,
        }
    }

    pub fn insert_first(mut self) -> Self {
        self.insert = true;
        self
    }

    pub fn in_netns(mut self, ns: &str) -> Self {
        self.netns = Some(ns.to_string());
        self
    }

    pub fn in_iface(mut self, iface: &str) -> Self {
        self.in_iface = Some(iface.to_string());
        self
    }

    pub fn out_iface(mut self, iface: &str) -> Self {
        self.out_iface = Some(iface.to_string());
        self
    }

    pub fn source(mut self, cidr: &str) -> Self {
        self.source = Some(cidr.to_string());
        self
    }

    pub fn dest(mut self, cidr: &str) -> Self {
        self.dest = Some(cidr.to_string());
        self
    }

    pub fn protocol(mut self, proto: &str) -> Self {
        self.protocol = Some(proto.to_string());
        self
    }

    pub fn dport(mut self, port: u16) -> Self {
        self.dport = Some(port);
        self
    }

    pub fn ct_state(mut self, states: &str) -> Self {
        self.ct_state = Some(states.to_string());
        self
    }

    /// The exact tokens recorded in metadata and replayed on teardown.
    pub fn add_tokens(&self) -> Vec<String> {
        self.tokens_with_verb(if self.insert { "-I" } else { "-A" })
    }

    /// Existence-probe form (`-C`).
    pub fn check_tokens(&self) -> Vec<String> {
        self.tokens_with_verb("-C")
    }

    fn tokens_with_verb(&self, verb: &str) -> Vec<String> {
        let mut t = Vec::new();
        if let Some(ns) = &self.netns {
            t.extend(["ip", "netns", "exec"].map(String::from));
            t.push(ns.clone());
        }
        t.push("iptables".to_string());
        if self.table != Table::Filter {
            t.push("-t".to_string());
            t.push(self.table.as_str().to_string());
        }
        t.push(verb.to_string());
        t.push(self.chain.clone());
        if let Some(v) = &self.in_iface {
            t.push("-i".to_string());
            t.push(v.clone());
        }
        if let Some(v) = &self.out_iface {
            t.push("-o".to_string());
            t.push(v.clone());
        }
        if let Some(v) = &self.source {
            t.push("-s".to_string());
            t.push(v.clone());
        }
        if let Some(v) = &self.dest {
            t.push("-d".to_string());
            t.push(v.clone());
        }
        if let Some(v) = &self.protocol {
            t.push("-p".to_string());
            t.push(v.clone());
        }
        if let Some(v) = self.dport {
            t.push("--dport".to_string());
            t.push(v.to_string());
        }
        if let Some(v) = &self.ct_state {
            t.extend(["-m", "state", "--state"].map(String::from));
            t.push(v.clone());
        }
        t.extend(["-m", "comment", "--comment"].map(String::from));
        t.push(self.comment.clone());
        t.push("-j".to_string());
        t.push(self.verdict.target().to_string());
        t
    }
}

/// Rewrite a recorded add-form (`-A`/`-I`) into the check form (`-C`).
pub fn check_form(recorded: &[String]) -> Vec<String> {
    swap_verb(recorded, "-C")
}

/// Rewrite a recorded add-form into the delete form (`-D`).
pub fn delete_form(recorded: &[String]) -> Vec<String> {
    swap_verb(recorded, "-D")
}

fn swap_verb(recorded: &[String], verb: &str) -> Vec<String> {
    let mut out = recorded.to_vec();
    for t in out.iter_mut() {
        if t == "-A" || t == "-I" {
            *t = verb.to_string();
            break;
        }
    }
    out
}

/// Drop the `-m comment --comment <tag>` match from a recorded form. Used
/// as a deletion fallback when the live rule no longer carries the tag.
pub fn strip_comment(recorded: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(recorded.len());
    let mut i = 0;
    while i < recorded.len() {
        if recorded[i] == "-m" && recorded.get(i + 1).map(String::as_str) == Some("comment") {
            // -m comment --comment <tag>
            i += 4;
            continue;
        }
        out.push(recorded[i].clone());
        i += 1;
    }
    out
}

/// The `vpcctl:` comment tag carried by a recorded form, if any.
pub fn comment_of(recorded: &[String]) -> Option<&str> {
    recorded
        .iter()
        .position(|t| t == "--comment")
        .and_then(|i| recorded.get(i + 1))
        .map(String::as_str)
}
