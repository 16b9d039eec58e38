//! Hooks a pass-through proxy session runs its traffic through before
//! forwarding it, one-for-one with the Facedancer proxy filter base class:
//! every hook defaults to passing its arguments through unchanged, so a
//! filter only needs to override what it actually wants to change.

use crate::request::ControlRequest;

/// A single stage in a [`FilterChain`]. Every method has a pass-through
/// default; implementors override only the hooks they care about.
pub trait Filter {
    /// Filters a SETUP stage for an IN control request before it's
    /// forwarded upstream. Returning `None` for the request NAKs the
    /// transfer instead of proxying it; `stalled = true` stalls it
    /// immediately without going upstream at all.
    fn filter_control_in_setup(
        &mut self,
        request: ControlRequest,
        stalled: bool,
    ) -> (Option<ControlRequest>, bool) {
        (Some(request), stalled)
    }

    /// Filters the data stage of a completed IN control request.
    fn filter_control_in(
        &mut self,
        request: ControlRequest,
        data: Vec<u8>,
        stalled: bool,
    ) -> (ControlRequest, Vec<u8>, bool) {
        (request, data, stalled)
    }

    /// Filters an OUT control request (and its data stage, if any) before
    /// forwarding upstream. Returning `None` absorbs the packet silently.
    fn filter_control_out(
        &mut self,
        request: ControlRequest,
        data: Option<Vec<u8>>,
    ) -> (Option<ControlRequest>, Option<Vec<u8>>) {
        (Some(request), data)
    }

    /// Called when the upstream device stalled an OUT control request.
    fn handle_out_request_stall(
        &mut self,
        request: ControlRequest,
        data: Option<Vec<u8>>,
        stalled: bool,
    ) -> (ControlRequest, Option<Vec<u8>>, bool) {
        (request, data, stalled)
    }

    /// Filters an IN token before it's issued upstream. Returning `None`
    /// absorbs the token.
    fn filter_in_token(&mut self, endpoint: u8) -> Option<u8> {
        Some(endpoint)
    }

    /// Filters the data returned by an upstream IN transfer. Returning
    /// `None` data causes a NAK to be sent to the target host instead.
    fn filter_in(&mut self, endpoint: u8, data: Option<Vec<u8>>) -> (u8, Option<Vec<u8>>) {
        (endpoint, data)
    }

    /// Filters an OUT packet sent by the target host before it's
    /// forwarded upstream.
    fn filter_out(&mut self, endpoint: u8, data: Option<Vec<u8>>) -> (u8, Option<Vec<u8>>) {
        (endpoint, data)
    }

    /// Called when an OUT transfer was stalled by the upstream device.
    fn handle_out_stall(
        &mut self,
        endpoint: u8,
        data: Option<Vec<u8>>,
        stalled: bool,
    ) -> (u8, Option<Vec<u8>>, bool) {
        (endpoint, data, stalled)
    }
}

/// Applies a sequence of [`Filter`]s left to right, threading each hook's
/// output into the next filter's input -- matching the original's
/// `for filter in self.filters:` iteration order.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self { filters: Vec::new() }
    }

    pub fn add(&mut self, filter: Box<dyn Filter>) -> &mut Self {
        self.filters.push(filter);
        self
    }

    pub fn control_in_setup(
        &mut self,
        mut request: ControlRequest,
    ) -> (Option<ControlRequest>, bool) {
        let mut stalled = false;
        for filter in &mut self.filters {
            let (req, st) = filter.filter_control_in_setup(request.clone(), stalled);
            stalled = st;
            match req {
                Some(r) => request = r,
                None => return (None, stalled),
            }
        }
        (Some(request), stalled)
    }

    pub fn control_in(
        &mut self,
        mut request: ControlRequest,
        mut data: Vec<u8>,
        mut stalled: bool,
    ) -> (ControlRequest, Vec<u8>, bool) {
        for filter in &mut self.filters {
            let (r, d, s) = filter.filter_control_in(request, data, stalled);
            request = r;
            data = d;
            stalled = s;
        }
        (request, data, stalled)
    }

    pub fn control_out(
        &mut self,
        mut request: Option<ControlRequest>,
        mut data: Option<Vec<u8>>,
    ) -> (Option<ControlRequest>, Option<Vec<u8>>) {
        for filter in &mut self.filters {
            let Some(req) = request.take() else {
                return (None, None);
            };
            let (r, d) = filter.filter_control_out(req, data);
            request = r;
            data = d;
        }
        (request, data)
    }

    /// Runs the upstream-stall hook after a filtered OUT control request
    /// was forwarded, letting a filter observe or override the outcome.
    pub fn control_out_stall_hook(
        &mut self,
        mut request: ControlRequest,
        mut data: Option<Vec<u8>>,
        mut stalled: bool,
    ) -> (ControlRequest, Option<Vec<u8>>, bool) {
        for filter in &mut self.filters {
            let (r, d, s) = filter.handle_out_request_stall(request, data, stalled);
            request = r;
            data = d;
            stalled = s;
        }
        (request, data, stalled)
    }

    pub fn in_token(&mut self, mut endpoint: Option<u8>) -> Option<u8> {
        for filter in &mut self.filters {
            let ep = endpoint?;
            endpoint = filter.filter_in_token(ep);
        }
        endpoint
    }

    pub fn in_data(
        &mut self,
        mut endpoint: u8,
        mut data: Option<Vec<u8>>,
    ) -> (u8, Option<Vec<u8>>) {
        for filter in &mut self.filters {
            let (e, d) = filter.filter_in(endpoint, data);
            endpoint = e;
            data = d;
        }
        (endpoint, data)
    }

    pub fn out_data(
        &mut self,
        mut endpoint: u8,
        mut data: Option<Vec<u8>>,
    ) -> (u8, Option<Vec<u8>>) {
        for filter in &mut self.filters {
            let (e, d) = filter.filter_out(endpoint, data);
            endpoint = e;
            data = d;
        }
        (endpoint, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct UppercaseOutFilter;

    impl Filter for UppercaseOutFilter {
        fn filter_out(&mut self, endpoint: u8, data: Option<Vec<u8>>) -> (u8, Option<Vec<u8>>) {
            (endpoint, data.map(|d| d.iter().map(|b| b.to_ascii_uppercase()).collect()))
        }
    }

    struct DropEndpointFive;

    impl Filter for DropEndpointFive {
        fn filter_out(&mut self, endpoint: u8, data: Option<Vec<u8>>) -> (u8, Option<Vec<u8>>) {
            if endpoint == 5 {
                (endpoint, None)
            } else {
                (endpoint, data)
            }
        }
    }

    #[test]
    fn chain_composes_left_to_right() {
        let mut chain = FilterChain::new();
        chain.add(Box::new(UppercaseOutFilter));
        chain.add(Box::new(DropEndpointFive));
        let (_, data) = chain.out_data(1, Some(b"hi".to_vec()));
        assert_eq!(data, Some(b"HI".to_vec()));

        let (_, data) = chain.out_data(5, Some(b"hi".to_vec()));
        assert_eq!(data, None);
    }

    #[test]
    fn empty_chain_passes_data_through_unchanged() {
        let mut chain = FilterChain::new();
        let (ep, data) = chain.out_data(2, Some(vec![1, 2, 3]));
        assert_eq!(ep, 2);
        assert_eq!(data, Some(vec![1, 2, 3]));
    }
}
