use nalgebra::DMatrix;

/// Strongly connected components of the directed graph `i → j` for every
/// `weights[(i, j)] > 0`, found with Tarjan's algorithm.
///
/// Components are returned with their vertices sorted ascending, and the
/// components themselves sorted by their smallest vertex.
pub fn strongly_connected_components(weights: &DMatrix<f64>) -> Vec<Vec<usize>> {
    let n = weights.nrows();
    let mut state = TarjanState::new(n);
    for vertex in 0..n {
        if state.index[vertex].is_none() {
            state.visit(vertex, weights);
        }
    }

    let mut components = state.components;
    for component in &mut components {
        component.sort_unstable();
    }
    components.sort_by_key(|c| c[0]);
    components
}

struct TarjanState {
    next_index: usize,
    index: Vec<Option<usize>>,
    low_link: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<usize>,
    components: Vec<Vec<usize>>,
}

impl TarjanState {
    fn new(n: usize) -> Self {
        Self {
            next_index: 0,
            index: vec![None; n],
            low_link: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::with_capacity(n),
            components: Vec::new(),
        }
    }

    fn visit(&mut self, v: usize, weights: &DMatrix<f64>) {
        self.index[v] = Some(self.next_index);
        self.low_link[v] = self.next_index;
        self.next_index += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        for w in 0..weights.ncols() {
            if weights[(v, w)] <= 0.0 {
                continue;
            }
            match self.index[w] {
                None => {
                    self.visit(w, weights);
                    self.low_link[v] = self.low_link[v].min(self.low_link[w]);
                }
                Some(w_index) if self.on_stack[w] => {
                    self.low_link[v] = self.low_link[v].min(w_index);
                }
                Some(_) => {}
            }
        }

        if Some(self.low_link[v]) == self.index[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}
