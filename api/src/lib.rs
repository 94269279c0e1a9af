/*
 * grid/api - the ServiceGrid custom resource and the label, annotation and
 * finalizer contract shared by the grid controllers
 */

pub mod labels;

pub mod servicegrid;
pub use servicegrid::ServiceGrid;
pub use servicegrid::ServiceGridSpec;
