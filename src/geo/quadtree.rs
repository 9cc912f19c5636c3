use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// Anything that can be stored in a [`Quadtree`].
pub trait Positioned {
    fn id(&self) -> u64;
    fn position(&self) -> (f64, f64);
}

/// Axis-aligned rectangle, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bounds {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Squared distance from a point to the closest point of the rectangle.
    pub fn distance_sq(&self, x: f64, y: f64) -> f64 {
        let dx = if x < self.min_x {
            self.min_x - x
        } else if x > self.max_x {
            x - self.max_x
        } else {
            0.0
        };
        let dy = if y < self.min_y {
            self.min_y - y
        } else if y > self.max_y {
            y - self.max_y
        } else {
            0.0
        };
        dx * dx + dy * dy
    }

    fn midpoint(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    fn quadrant_index(&self, x: f64, y: f64) -> usize {
        let (mid_x, mid_y) = self.midpoint();
        let east = usize::from(x >= mid_x);
        let north = usize::from(y >= mid_y);
        north * 2 + east
    }

    fn quadrant(&self, index: usize) -> Bounds {
        let (mid_x, mid_y) = self.midpoint();
        let (min_x, max_x) = if index % 2 == 1 {
            (mid_x, self.max_x)
        } else {
            (self.min_x, mid_x)
        };
        let (min_y, max_y) = if index >= 2 {
            (mid_y, self.max_y)
        } else {
            (self.min_y, mid_y)
        };
        Bounds::new(min_x, min_y, max_x, max_y)
    }
}

#[derive(Debug)]
struct Node<T> {
    bounds: Bounds,
    depth: usize,
    items: Vec<T>,
    children: Option<Box<[Node<T>; 4]>>,
}

impl<T: Positioned> Node<T> {
    fn new(bounds: Bounds, depth: usize) -> Self {
        Self {
            bounds,
            depth,
            items: Vec::new(),
            children: None,
        }
    }

    fn insert(&mut self, item: T, capacity: usize, max_depth: usize) {
        let (x, y) = item.position();
        if let Some(children) = self.children.as_mut() {
            if self.bounds.contains(x, y) {
                let idx = self.bounds.quadrant_index(x, y);
                children[idx].insert(item, capacity, max_depth);
            } else {
                self.items.push(item);
            }
            return;
        }

        self.items.push(item);
        if self.items.len() > capacity && self.depth < max_depth {
            self.split(capacity, max_depth);
        }
    }

    fn split(&mut self, capacity: usize, max_depth: usize) {
        let depth = self.depth + 1;
        let b = self.bounds;
        self.children = Some(Box::new([
            Node::new(b.quadrant(0), depth),
            Node::new(b.quadrant(1), depth),
            Node::new(b.quadrant(2), depth),
            Node::new(b.quadrant(3), depth),
        ]));

        let items = std::mem::take(&mut self.items);
        for item in items {
            self.insert(item, capacity, max_depth);
        }
    }

    fn remove(&mut self, id: u64, x: f64, y: f64) -> Option<T> {
        if let Some(children) = self.children.as_mut() {
            if self.bounds.contains(x, y) {
                let idx = self.bounds.quadrant_index(x, y);
                return children[idx].remove(id, x, y);
            }
        }
        let pos = self.items.iter().position(|i| i.id() == id)?;
        Some(self.items.swap_remove(pos))
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a T>) {
        out.extend(self.items.iter());
        if let Some(children) = self.children.as_ref() {
            for child in children.iter() {
                child.collect(out);
            }
        }
    }
}

/// Heap entry ordered by ascending distance.
struct Visit<'a, T> {
    distance_sq: f64,
    node: &'a Node<T>,
}

impl<T> PartialEq for Visit<'_, T> {
    fn eq(&self, other: &Self) -> bool {
        self.distance_sq.total_cmp(&other.distance_sq) == Ordering::Equal
    }
}

impl<T> Eq for Visit<'_, T> {}

impl<T> PartialOrd for Visit<'_, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Visit<'_, T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap, flip for nearest-first
        other.distance_sq.total_cmp(&self.distance_sq)
    }
}

/// Mutable point quadtree with k-nearest-neighbour search.
///
/// Points outside the root bounds are kept at the root and are always
/// considered by queries. Items are addressed by [`Positioned::id`]; inserting
/// an id that is already present replaces the old entry.
#[derive(Debug)]
pub struct Quadtree<T> {
    root: Node<T>,
    capacity: usize,
    max_depth: usize,
    positions: HashMap<u64, (f64, f64)>,
}

impl<T: Positioned> Quadtree<T> {
    pub fn new(bounds: Bounds, capacity: usize, max_depth: usize) -> Self {
        Self {
            root: Node::new(bounds, 0),
            capacity: capacity.max(1),
            max_depth,
            positions: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.positions.contains_key(&id)
    }

    /// Insert an item, replacing any existing item with the same id.
    pub fn insert(&mut self, item: T) {
        let id = item.id();
        if let Some((x, y)) = self.positions.remove(&id) {
            self.root.remove(id, x, y);
        }
        self.positions.insert(id, item.position());
        self.root.insert(item, self.capacity, self.max_depth);
    }

    pub fn remove(&mut self, id: u64) -> Option<T> {
        let (x, y) = self.positions.remove(&id)?;
        self.root.remove(id, x, y)
    }

    /// Replace an item in place. Alias of [`Quadtree::insert`].
    pub fn replace(&mut self, item: T) {
        self.insert(item);
    }

    pub fn items(&self) -> Vec<&T> {
        let mut out = Vec::with_capacity(self.len());
        self.root.collect(&mut out);
        out
    }

    /// Up to `k` items nearest to `(x, y)` within `max_distance` that pass
    /// `filter`, nearest first.
    pub fn k_nearest<F>(&self, x: f64, y: f64, k: usize, max_distance: f64, filter: F) -> Vec<&T>
    where
        F: Fn(&T) -> bool,
    {
        if k == 0 || self.is_empty() {
            return Vec::new();
        }

        let max_sq = max_distance * max_distance;
        let mut found: Vec<(f64, &T)> = Vec::with_capacity(k);
        let mut heap = BinaryHeap::new();
        heap.push(Visit {
            distance_sq: 0.0,
            node: &self.root,
        });

        while let Some(Visit { distance_sq, node }) = heap.pop() {
            if distance_sq > max_sq {
                break;
            }
            if found.len() == k && found.last().is_some_and(|(d, _)| distance_sq > *d) {
                break;
            }

            for item in &node.items {
                let (ix, iy) = item.position();
                let d = (ix - x).powi(2) + (iy - y).powi(2);
                if d > max_sq || !filter(item) {
                    continue;
                }
                let at = found.partition_point(|(other, _)| *other <= d);
                if at < k {
                    found.insert(at, (d, item));
                    found.truncate(k);
                }
            }

            if let Some(children) = node.children.as_ref() {
                for child in children.iter() {
                    heap.push(Visit {
                        distance_sq: child.bounds.distance_sq(x, y),
                        node: child,
                    });
                }
            }
        }

        found.into_iter().map(|(_, item)| item).collect()
    }
}
