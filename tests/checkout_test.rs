mod common;

use std::time::Duration;

use axum::http::{Method, StatusCode};
use common::{assert_json, money, DiscountSeed, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;
use storefront_api::entities::DiscountType;
use uuid::Uuid;

async fn add_to_cart(app: &TestApp, user: Uuid, product_id: Uuid, quantity: i32) {
    let response = app
        .request(
            Method::POST,
            "/cart/items",
            Some(json!({ "product_id": product_id, "quantity": quantity })),
            Some(user),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
}

fn checkout_body() -> serde_json::Value {
    json!({ "payment_method_token": "pm_card_visa" })
}

#[tokio::test]
async fn checkout_prices_a_discounted_order() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    app.seed_default_address(user).await;
    let product = app.seed_product("Bookshelf", None, dec!(50.00), 20).await;
    let discount = app
        .seed_discount(DiscountSeed::new("PCT10", DiscountType::Percentage, dec!(10)))
        .await;

    add_to_cart(&app, user, product.id, 2).await;
    app.request(
        Method::POST,
        "/cart/discount",
        Some(json!({ "code": "PCT10" })),
        Some(user),
    )
    .await;

    let response = app
        .request(Method::POST, "/orders", Some(checkout_body()), Some(user))
        .await;
    let body = assert_json(response, StatusCode::CREATED).await;

    // 100 - 10 discount + 5 shipping + 8% tax on 90.
    assert_eq!(money(&body["subtotal"]), dec!(100));
    assert_eq!(money(&body["discount_amount"]), dec!(10));
    assert_eq!(body["discount_code"], "PCT10");
    assert_eq!(money(&body["shipping_cost"]), dec!(5));
    assert_eq!(money(&body["tax_amount"]), dec!(7.20));
    assert_eq!(money(&body["total_price"]), dec!(102.20));
    assert_eq!(body["status"], "processing");
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
    assert_eq!(body["items"][0]["product_name"], "Bookshelf");

    // The gateway was charged the exact total.
    let charges = app.gateway.charges();
    assert_eq!(charges.len(), 1);
    assert_eq!(charges[0].0, dec!(102.20));

    // Sold units left both counters; the cart is empty and the discount
    // use was counted.
    let product = app.get_product(product.id).await;
    assert_eq!(product.inventory, 18);
    assert_eq!(product.reserved_inventory, 0);

    let cart = assert_json(
        app.request(Method::GET, "/cart", None, Some(user)).await,
        StatusCode::OK,
    )
    .await;
    assert!(cart["items"].as_array().unwrap().is_empty());
    assert!(cart["discount"].is_null());

    let discount = app
        .state
        .services
        .discounts
        .get_by_id(discount.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(discount.times_used, 1);
}

#[tokio::test]
async fn checkout_silently_drops_a_discount_that_became_ineligible() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    app.seed_default_address(user).await;
    let keep = app.seed_product("Poster", None, dec!(30.00), 10).await;
    let drop = app.seed_product("Frame", None, dec!(20.00), 10).await;
    app.seed_discount(DiscountSeed {
        min_purchase_amount: Some(dec!(50)),
        ..DiscountSeed::new("SAVE5", DiscountType::Fixed, dec!(5))
    })
    .await;

    add_to_cart(&app, user, keep.id, 1).await;
    add_to_cart(&app, user, drop.id, 1).await;
    let response = app
        .request(
            Method::POST,
            "/cart/discount",
            Some(json!({ "code": "SAVE5" })),
            Some(user),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // Removing the frame pushes the subtotal below the discount's minimum.
    app.request(
        Method::DELETE,
        &format!("/cart/items/{}", drop.id),
        None,
        Some(user),
    )
    .await;

    let response = app
        .request(Method::POST, "/orders", Some(checkout_body()), Some(user))
        .await;
    let body = assert_json(response, StatusCode::CREATED).await;

    // The order went through without the discount: 30 + 5 + 2.40.
    assert!(body["discount_code"].is_null());
    assert_eq!(money(&body["discount_amount"]), dec!(0));
    assert_eq!(money(&body["tax_amount"]), dec!(2.40));
    assert_eq!(money(&body["total_price"]), dec!(37.40));
}

#[tokio::test]
async fn declined_payment_leaves_no_side_effects() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    app.seed_default_address(user).await;
    let product = app.seed_product("Rug", None, dec!(60.00), 10).await;
    let discount = app
        .seed_discount(DiscountSeed {
            usage_limit: Some(1),
            ..DiscountSeed::new("PCT10", DiscountType::Percentage, dec!(10))
        })
        .await;

    add_to_cart(&app, user, product.id, 1).await;
    app.request(
        Method::POST,
        "/cart/discount",
        Some(json!({ "code": "PCT10" })),
        Some(user),
    )
    .await;

    app.gateway.set_decline(true);
    let response = app
        .request(Method::POST, "/orders", Some(checkout_body()), Some(user))
        .await;
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    // Reservation, cart contents, discount attachment, and usage counter
    // are all untouched.
    let product = app.get_product(product.id).await;
    assert_eq!(product.inventory, 10);
    assert_eq!(product.reserved_inventory, 1);

    let cart = assert_json(
        app.request(Method::GET, "/cart", None, Some(user)).await,
        StatusCode::OK,
    )
    .await;
    assert_eq!(cart["items"].as_array().unwrap().len(), 1);
    assert_eq!(cart["discount"]["code"], "PCT10");

    let discount = app
        .state
        .services
        .discounts
        .get_by_id(discount.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(discount.times_used, 0);

    let orders = assert_json(
        app.request(Method::GET, "/orders", None, Some(user)).await,
        StatusCode::OK,
    )
    .await;
    assert!(orders.as_array().unwrap().is_empty());

    // The declined attempt handed its claimed use back: retrying still
    // gets the limit-1 discount.
    app.gateway.set_decline(false);
    let body = assert_json(
        app.request(Method::POST, "/orders", Some(checkout_body()), Some(user))
            .await,
        StatusCode::CREATED,
    )
    .await;
    assert_eq!(body["discount_code"], "PCT10");
    assert_eq!(money(&body["discount_amount"]), dec!(6));
}

#[tokio::test]
async fn free_shipping_discount_zeroes_the_shipping_cost() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    app.seed_default_address(user).await;
    let product = app.seed_product("Blanket", None, dec!(25.00), 10).await;
    app.seed_discount(DiscountSeed {
        is_free_shipping: true,
        ..DiscountSeed::new("FREESHIP", DiscountType::Fixed, dec!(0))
    })
    .await;

    add_to_cart(&app, user, product.id, 2).await;
    app.request(
        Method::POST,
        "/cart/discount",
        Some(json!({ "code": "FREESHIP" })),
        Some(user),
    )
    .await;

    let response = app
        .request(Method::POST, "/orders", Some(checkout_body()), Some(user))
        .await;
    let body = assert_json(response, StatusCode::CREATED).await;
    assert_eq!(money(&body["shipping_cost"]), dec!(0));
    // 50 + 8% tax, no shipping.
    assert_eq!(money(&body["total_price"]), dec!(54.00));
}

#[tokio::test]
async fn checkout_fires_low_stock_notification() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    app.seed_default_address(user).await;
    let product = app.seed_product("Teapot", None, dec!(15.00), 12).await;

    add_to_cart(&app, user, product.id, 3).await;
    let response = app
        .request(Method::POST, "/orders", Some(checkout_body()), Some(user))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    // The alert runs on a spawned task.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let alerts = app.notifier.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].0, product.id);
    assert_eq!(alerts[0].1, "Teapot");
    assert_eq!(alerts[0].2, 9);
}

#[tokio::test]
async fn checkout_with_empty_cart_is_a_conflict() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    app.seed_default_address(user).await;

    let response = app
        .request(Method::POST, "/orders", Some(checkout_body()), Some(user))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn checkout_requires_a_resolvable_address() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let product = app.seed_product("Vase", None, dec!(35.00), 10).await;
    add_to_cart(&app, user, product.id, 1).await;

    // No default address on file.
    let response = app
        .request(Method::POST, "/orders", Some(checkout_body()), Some(user))
        .await;
    let body = assert_json(response, StatusCode::BAD_REQUEST).await;
    assert!(body["message"].as_str().unwrap().contains("shipping address"));

    // An explicit id belonging to someone else is not found.
    let other_user = Uuid::new_v4();
    let foreign_address = app.seed_default_address(other_user).await;
    let response = app
        .request(
            Method::POST,
            "/orders",
            Some(json!({
                "payment_method_token": "pm_card_visa",
                "shipping_address_id": foreign_address.id,
            })),
            Some(user),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Nothing was charged along the way.
    assert!(app.gateway.charges().is_empty());
}

#[tokio::test]
async fn concurrent_checkouts_cannot_overdraw_a_usage_limit() {
    let app = TestApp::new().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    app.seed_default_address(alice).await;
    app.seed_default_address(bob).await;
    let product = app.seed_product("Notebook", None, dec!(40.00), 20).await;
    let discount = app
        .seed_discount(DiscountSeed {
            usage_limit: Some(1),
            ..DiscountSeed::new("LASTONE", DiscountType::Fixed, dec!(10))
        })
        .await;

    for user in [alice, bob] {
        add_to_cart(&app, user, product.id, 1).await;
        let response = app
            .request(
                Method::POST,
                "/cart/discount",
                Some(json!({ "code": "LASTONE" })),
                Some(user),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let checkout = app.state.services.checkout.clone();
    let (first, second) = tokio::join!(
        checkout.create_order(alice, "pm_card_visa", None, None),
        checkout.create_order(bob, "pm_card_visa", None, None),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    // Both orders go through, but only one carries the discount; the
    // other was repriced at full cost: 40 + 5 shipping + 3.20 tax.
    let (winner, loser) = if first.discount_code.is_some() {
        (&first, &second)
    } else {
        (&second, &first)
    };
    assert_eq!(winner.discount_code.as_deref(), Some("LASTONE"));
    assert_eq!(winner.discount_amount, dec!(10));
    assert_eq!(winner.total_price, dec!(37.40));
    assert!(loser.discount_code.is_none());
    assert_eq!(loser.discount_amount, dec!(0));
    assert_eq!(loser.total_price, dec!(48.20));

    let discount = app
        .state
        .services
        .discounts
        .get_by_id(discount.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(discount.times_used, 1);
}

#[tokio::test]
async fn concurrent_double_checkout_creates_exactly_one_order() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    app.seed_default_address(user).await;
    let product = app.seed_product("Clock", None, dec!(45.00), 5).await;
    add_to_cart(&app, user, product.id, 1).await;

    let checkout = app.state.services.checkout.clone();
    let (first, second) = tokio::join!(
        checkout.create_order(user, "pm_card_visa", None, None),
        checkout.create_order(user, "pm_card_visa", None, None),
    );

    // One submission wins; the loser finds the cart already emptied.
    let outcomes = [first.is_ok(), second.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    assert_eq!(app.gateway.charges().len(), 1);

    let orders = assert_json(
        app.request(Method::GET, "/orders", None, Some(user)).await,
        StatusCode::OK,
    )
    .await;
    assert_eq!(orders.as_array().unwrap().len(), 1);
}
