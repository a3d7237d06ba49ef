//! Binary tree of non-overlapping extents ordered by start offset.
//!
//! A tree is built fresh for every resolve: extents are folded in one at a
//! time with [`Interval::overlay`], which cuts whatever the tree held inside
//! the new extent's range and hangs the two remaining halves under it. An
//! in-order walk then yields the surviving pieces left to right.

/// Payload carried by an extent node.
pub trait Extent: Clone {
    /// Payload for a synthetic node covering bytes nobody wrote.
    fn gap() -> Self;

    /// The same payload seen `delta` bytes further into the extent.
    fn advance(&self, delta: u32) -> Self;
}

pub type Link<P> = Option<Box<Interval<P>>>;

#[derive(Debug)]
pub struct Interval<P> {
    pub start: u32,
    pub len: u32,
    pub payload: P,
    left: Link<P>,
    right: Link<P>,
}

impl<P: Extent> Interval<P> {
    pub fn new(start: u32, len: u32, payload: P) -> Box<Self> {
        Box::new(Self {
            start,
            len,
            payload,
            left: None,
            right: None,
        })
    }

    fn leaf(start: u32, len: u32, payload: P) -> Link<P> {
        if len == 0 {
            None
        } else {
            Some(Self::new(start, len, payload))
        }
    }

    pub fn end(&self) -> u32 {
        self.start.saturating_add(self.len)
    }

    /// Split `node` into the parts before and after `pos`.
    ///
    /// Bytes between `pos` and the nearest extent on either side are filled
    /// with gap nodes so that each half stays contiguous up to the cut.
    pub fn cut(node: Link<P>, pos: u32) -> (Link<P>, Link<P>) {
        let Some(mut n) = node else {
            return (None, None);
        };
        if pos <= n.start {
            if n.left.is_none() {
                n.left = Self::leaf(pos, n.start - pos, P::gap());
            }
            let (left, rest) = Self::cut(n.left.take(), pos);
            n.left = rest;
            (left, Some(n))
        } else if pos < n.end() {
            let head = pos - n.start;
            let right = Box::new(Interval {
                start: pos,
                len: n.len - head,
                payload: n.payload.advance(head),
                left: None,
                right: n.right.take(),
            });
            n.len = head;
            (Some(n), Some(right))
        } else {
            if n.right.is_none() {
                let end = n.end();
                n.right = Self::leaf(end, pos - end, P::gap());
            }
            let (rest, right) = Self::cut(n.right.take(), pos);
            n.right = rest;
            (Some(n), right)
        }
    }

    /// Fold `node` over `root`; `node` wins wherever the two overlap.
    pub fn overlay(root: Link<P>, mut node: Box<Self>) -> Box<Self> {
        let (left, rest) = Self::cut(root, node.start);
        let (_, right) = Self::cut(rest, node.end());
        node.left = left;
        node.right = right;
        node
    }

    /// Build a tree from extents in precedence order: later items win.
    pub fn fold<I>(items: I) -> Link<P>
    where
        I: IntoIterator<Item = (u32, u32, P)>,
    {
        let mut root: Link<P> = None;
        for (start, len, payload) in items {
            if len == 0 {
                continue;
            }
            root = Some(Self::overlay(root, Self::new(start, len, payload)));
        }
        root
    }

    /// In-order traversal.
    pub fn visit<F: FnMut(u32, u32, &P)>(&self, f: &mut F) {
        if let Some(left) = &self.left {
            left.visit(f);
        }
        f(self.start, self.len, &self.payload);
        if let Some(right) = &self.right {
            right.visit(f);
        }
    }

    pub fn to_vec(root: &Link<P>) -> Vec<(u32, u32, P)> {
        let mut out = Vec::new();
        if let Some(node) = root {
            node.visit(&mut |start, len, payload: &P| out.push((start, len, payload.clone())));
        }
        out
    }
}
