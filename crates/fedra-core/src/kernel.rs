//! Compiled payloads: small RISC expression DAGs over `f64`.
//!
//! A kernel maps a flat list of scalar inputs to a flat list of scalar
//! outputs. Nodes are stored in topological order (children always precede
//! their parents), so evaluation is a single forward sweep.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Index of a node inside a kernel. Copy, 4 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "k{}", self.0)
    }
}

/// One kernel operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelNode {
    /// Input scalar by position.
    Var(u32),
    /// Literal stored as bits for Hash/Eq.
    Lit(u64),
    Add(NodeId, NodeId),
    Mul(NodeId, NodeId),
    Neg(NodeId),
    /// 1/x
    Recip(NodeId),
    Sqrt(NodeId),
    Sin(NodeId),
    /// 2^x
    Exp2(NodeId),
    Log2(NodeId),
    Max(NodeId, NodeId),
}

impl KernelNode {
    fn operands(&self) -> [Option<NodeId>; 2] {
        match *self {
            KernelNode::Var(_) | KernelNode::Lit(_) => [None, None],
            KernelNode::Add(a, b) | KernelNode::Mul(a, b) | KernelNode::Max(a, b) => {
                [Some(a), Some(b)]
            }
            KernelNode::Neg(a)
            | KernelNode::Recip(a)
            | KernelNode::Sqrt(a)
            | KernelNode::Sin(a)
            | KernelNode::Exp2(a)
            | KernelNode::Log2(a) => [Some(a), None],
        }
    }
}

/// A finished kernel. Travels as [`crate::wire::WireKernel`], so decoding
/// always goes through [`Kernel::from_parts`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Kernel {
    nodes: Vec<KernelNode>,
    outputs: Vec<NodeId>,
    n_inputs: u32,
}

impl Kernel {
    /// Reassemble a kernel from raw parts, checking topological order,
    /// operand bounds and input indices.
    pub fn from_parts(nodes: Vec<KernelNode>, outputs: Vec<NodeId>, n_inputs: u32) -> Result<Self> {
        for (i, node) in nodes.iter().enumerate() {
            if let KernelNode::Var(v) = node {
                if *v >= n_inputs {
                    return Err(CoreError::MalformedIr(format!(
                        "kernel input {v} out of range ({n_inputs} inputs)"
                    )));
                }
            }
            for operand in node.operands().into_iter().flatten() {
                if operand.index() >= i {
                    return Err(CoreError::MalformedIr(format!(
                        "kernel node {i} refers forward to {operand:?}"
                    )));
                }
            }
        }
        if let Some(bad) = outputs.iter().find(|o| o.index() >= nodes.len()) {
            return Err(CoreError::MalformedIr(format!(
                "kernel output {bad:?} out of range"
            )));
        }
        Ok(Self {
            nodes,
            outputs,
            n_inputs,
        })
    }

    pub fn nodes(&self) -> &[KernelNode] {
        &self.nodes
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn num_inputs(&self) -> usize {
        self.n_inputs as usize
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Evaluate all outputs, sharing intermediate values.
    pub fn eval(&self, inputs: &[f64]) -> Result<Vec<f64>> {
        if inputs.len() != self.num_inputs() {
            return Err(CoreError::mismatch(format!(
                "kernel takes {} inputs, got {}",
                self.n_inputs,
                inputs.len()
            )));
        }
        let mut vals: Vec<f64> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let v = match *node {
                KernelNode::Var(i) => inputs[i as usize],
                KernelNode::Lit(bits) => f64::from_bits(bits),
                KernelNode::Add(a, b) => vals[a.index()] + vals[b.index()],
                KernelNode::Mul(a, b) => vals[a.index()] * vals[b.index()],
                KernelNode::Neg(a) => -vals[a.index()],
                KernelNode::Recip(a) => vals[a.index()].recip(),
                KernelNode::Sqrt(a) => vals[a.index()].sqrt(),
                KernelNode::Sin(a) => vals[a.index()].sin(),
                KernelNode::Exp2(a) => vals[a.index()].exp2(),
                KernelNode::Log2(a) => vals[a.index()].log2(),
                KernelNode::Max(a, b) => vals[a.index()].max(vals[b.index()]),
            };
            vals.push(v);
        }
        Ok(self.outputs.iter().map(|o| vals[o.index()]).collect())
    }
}

/// Kernel under construction, with structural interning.
///
/// Building the same subexpression twice returns the same `NodeId`.
#[derive(Default)]
pub struct KernelBuilder {
    nodes: Vec<KernelNode>,
    intern: HashMap<KernelNode, NodeId>,
    n_inputs: u32,
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, node: KernelNode) -> NodeId {
        if let Some(&id) = self.intern.get(&node) {
            return id;
        }
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.intern.insert(node, id);
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Input scalar `n`. Grows the input count as needed.
    pub fn input(&mut self, n: u32) -> NodeId {
        self.n_inputs = self.n_inputs.max(n + 1);
        self.insert(KernelNode::Var(n))
    }

    pub fn lit(&mut self, v: f64) -> NodeId {
        self.insert(KernelNode::Lit(v.to_bits()))
    }

    pub fn add(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.insert(KernelNode::Add(a, b))
    }

    pub fn mul(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.insert(KernelNode::Mul(a, b))
    }

    pub fn neg(&mut self, a: NodeId) -> NodeId {
        self.insert(KernelNode::Neg(a))
    }

    pub fn sub(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let nb = self.neg(b);
        self.add(a, nb)
    }

    pub fn recip(&mut self, a: NodeId) -> NodeId {
        self.insert(KernelNode::Recip(a))
    }

    pub fn div(&mut self, a: NodeId, b: NodeId) -> NodeId {
        let rb = self.recip(b);
        self.mul(a, rb)
    }

    pub fn sqrt(&mut self, a: NodeId) -> NodeId {
        self.insert(KernelNode::Sqrt(a))
    }

    pub fn sin(&mut self, a: NodeId) -> NodeId {
        self.insert(KernelNode::Sin(a))
    }

    pub fn exp2(&mut self, a: NodeId) -> NodeId {
        self.insert(KernelNode::Exp2(a))
    }

    pub fn log2(&mut self, a: NodeId) -> NodeId {
        self.insert(KernelNode::Log2(a))
    }

    pub fn max(&mut self, a: NodeId, b: NodeId) -> NodeId {
        self.insert(KernelNode::Max(a, b))
    }

    /// Declare at least `n` inputs, even if some are unused.
    pub fn with_inputs(mut self, n: u32) -> Self {
        self.n_inputs = self.n_inputs.max(n);
        self
    }

    /// Finish with the given outputs.
    pub fn finish(self, outputs: Vec<NodeId>) -> Kernel {
        Kernel {
            nodes: self.nodes,
            outputs,
            n_inputs: self.n_inputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning() {
        let mut b = KernelBuilder::new();
        let x = b.input(0);
        let x2 = b.input(0);
        assert_eq!(x, x2);
        let one = b.lit(1.0);
        let a = b.add(x, one);
        let a2 = b.add(x, one);
        assert_eq!(a, a2);
        assert_eq!(b.len(), 3);
    }

    #[test]
    fn eval_shares_intermediates() {
        let mut b = KernelBuilder::new();
        let x = b.input(0);
        let y = b.input(1);
        let s = b.add(x, y);
        let sq = b.mul(s, s);
        let m = b.max(x, y);
        let k = b.finish(vec![sq, m]);
        assert_eq!(k.num_inputs(), 2);
        assert_eq!(k.eval(&[1.0, 2.0]).unwrap(), vec![9.0, 2.0]);
    }

    #[test]
    fn eval_primitives() {
        let mut b = KernelBuilder::new();
        let x = b.input(0);
        let e = b.exp2(x);
        let l = b.log2(e);
        let r = b.sqrt(e);
        let d = b.div(x, r);
        let k = b.finish(vec![e, l, d]);
        let out = k.eval(&[4.0]).unwrap();
        assert_eq!(out[0], 16.0);
        assert_eq!(out[1], 4.0);
        assert_eq!(out[2], 1.0);
    }

    #[test]
    fn input_count_checked() {
        let mut b = KernelBuilder::new();
        let x = b.input(0);
        let k = b.finish(vec![x]);
        assert!(k.eval(&[]).is_err());
    }

    #[test]
    fn from_parts_rejects_forward_refs() {
        let bad = Kernel::from_parts(
            vec![KernelNode::Neg(NodeId(1)), KernelNode::Var(0)],
            vec![NodeId(0)],
            1,
        );
        assert!(matches!(bad, Err(CoreError::MalformedIr(_))));

        let bad_var = Kernel::from_parts(vec![KernelNode::Var(3)], vec![NodeId(0)], 1);
        assert!(bad_var.is_err());

        let bad_out = Kernel::from_parts(vec![KernelNode::Var(0)], vec![NodeId(4)], 1);
        assert!(bad_out.is_err());
    }
}
