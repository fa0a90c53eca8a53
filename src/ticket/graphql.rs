use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

pub const GET_LISTING_OPERATION: &str = "GetListing";
pub const ADD_TICKETS_TO_CART_OPERATION: &str = "AddTicketsToCart";

pub const ADD_TICKETS_TO_CART_MUTATION: &str = "mutation AddTicketsToCart($listingId: ID!, $listingHash: String!, $amountOfTickets: Int!) {
  addTicketsToCart(input: {listingId: $listingId, listingHash: $listingHash, amountOfTickets: $amountOfTickets}) {
    cart {
      id
      checkoutUrl
      __typename
    }
    errors {
      code
      message
      __typename
    }
    __typename
  }
}";

const LISTING_ID_PREFIX: &str = "Listing:";

/// A GraphQL request body: operation name, document and variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlRequest<V> {
    #[serde(default)]
    pub operation_name: Option<String>,
    #[serde(default)]
    pub query: String,
    pub variables: V,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingVariables {
    pub listing_id: ListingId,
    pub listing_hash: String,
}

/// Listing ids arrive as strings, older clients send bare numbers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ListingId {
    Text(String),
    Number(i64),
}

impl ListingId {
    fn into_text(self) -> String {
        match self {
            ListingId::Text(text) => text,
            ListingId::Number(number) => number.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartVariables {
    pub listing_id: String,
    pub listing_hash: String,
    pub amount_of_tickets: u32,
}

/// Opaque relay id for a listing. Ids that parse as an integer are encoded as
/// base64 of `Listing:<id>`; anything else is assumed opaque already.
pub fn encode_listing_id(id: &str) -> String {
    if id.parse::<i64>().is_ok() {
        BASE64.encode(format!("{LISTING_ID_PREFIX}{id}"))
    } else {
        id.to_string()
    }
}

/// Derive the `AddTicketsToCart` request body from a `GetListing` body.
pub fn cart_request_from_listing(
    listing_body: &[u8],
    mutation_document: &str,
) -> serde_json::Result<GraphqlRequest<CartVariables>> {
    let listing: GraphqlRequest<ListingVariables> = serde_json::from_slice(listing_body)?;
    let listing_id = listing.variables.listing_id.into_text();

    Ok(GraphqlRequest {
        operation_name: Some(ADD_TICKETS_TO_CART_OPERATION.into()),
        query: mutation_document.to_string(),
        variables: CartVariables {
            listing_id: encode_listing_id(&listing_id),
            listing_hash: listing.variables.listing_hash,
            amount_of_tickets: 1,
        },
    })
}

pub fn cart_body_from_listing(
    listing_body: &[u8],
    mutation_document: &str,
) -> serde_json::Result<Vec<u8>> {
    let cart = cart_request_from_listing(listing_body, mutation_document)?;
    serde_json::to_vec(&cart)
}
